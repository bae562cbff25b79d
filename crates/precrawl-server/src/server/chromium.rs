//! Headless Chromium backend driven over CDP with `chromiumoxide`.
//!
//! One browser process is shared by every tab of the pool. The CDP event
//! handler runs on its own task for as long as the allocator lives.

use crate::server::config::ServerConfig;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig, Page};
use core::time::Duration;
use futures::StreamExt;
use precrawl::{BLANK_URL, Error, PageAllocator, RenderParams, Renderer, Result};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct ChromiumOptions {
    pub executable: Option<PathBuf>,
    pub no_sandbox: bool,
}

impl From<&ServerConfig> for ChromiumOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            executable: config.chrome_executable.clone(),
            no_sandbox: config.no_sandbox,
        }
    }
}

fn cdp_error(e: impl core::fmt::Display) -> Error {
    Error::Render(e.to_string())
}

pub struct ChromiumAllocator {
    browser: Mutex<Option<Browser>>,
    handler: JoinHandle<()>,
}

impl ChromiumAllocator {
    /// Starts the browser process and its CDP event loop.
    pub async fn launch(options: ChromiumOptions) -> anyhow::Result<Self> {
        let mut builder = BrowserConfig::builder().args(vec![
            "--disable-gpu",
            "--disable-dev-shm-usage",
            "--no-first-run",
            "--no-default-browser-check",
            "--disable-background-networking",
        ]);
        if let Some(executable) = options.executable {
            builder = builder.chrome_executable(executable);
        }
        if options.no_sandbox {
            builder = builder.no_sandbox();
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!(e))
            .context("invalid browser configuration")?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch browser")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!("Browser event error: {e}");
                }
            }
            tracing::debug!("Browser event loop finished");
        });

        tracing::info!("Browser launched");
        Ok(Self {
            browser: Mutex::new(Some(browser)),
            handler,
        })
    }

    /// Closes the browser process. Tabs still open are closed with it.
    pub async fn shutdown(&self) {
        let Some(mut browser) = self.browser.lock().await.take() else {
            return;
        };

        if let Err(e) = browser.close().await {
            tracing::warn!("Browser close failed: {e}");
        }
        if let Err(e) = browser.wait().await {
            tracing::warn!("Browser process did not exit cleanly: {e}");
        }
        self.handler.abort();
        tracing::info!("Browser shut down");
    }
}

impl Drop for ChromiumAllocator {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[async_trait]
impl PageAllocator for ChromiumAllocator {
    type Page = Page;

    async fn create(&self) -> Result<Page> {
        let browser = self.browser.lock().await;
        let browser = browser.as_ref().ok_or(Error::PoolClosed)?;
        browser.new_page(BLANK_URL).await.map_err(cdp_error)
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<()> {
        page.goto(url).await.map(|_| ()).map_err(cdp_error)
    }

    fn destroy(&self, page: Page) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = page.close().await {
                        tracing::debug!("Tab close failed: {e}");
                    }
                });
            }
            Err(_) => tracing::debug!("No runtime to close tab, leaving it to browser shutdown"),
        }
    }
}

/// Renders by navigating, settling, waiting for the selector to become
/// visible and reading back the serialized document.
#[derive(Debug, Default)]
pub struct ChromiumRenderer;

#[async_trait]
impl Renderer<Page> for ChromiumRenderer {
    async fn render(&self, page: &Page, params: &RenderParams) -> Result<String> {
        page.goto(params.target_url.as_str())
            .await
            .map_err(cdp_error)?;

        settle(params.wait).await;
        let visible = wait_visible(page, &params.selector, params.selector_timeout).await?;
        settle(params.wait).await;

        let html = page.content().await.map_err(cdp_error)?;
        if visible {
            Ok(html)
        } else {
            Err(Error::SelectorWaitTimeout {
                selector: params.selector.clone(),
                html,
            })
        }
    }
}

async fn settle(wait: Duration) {
    if !wait.is_zero() {
        sleep(wait).await;
    }
}

/// Polls until `selector` matches a visible element. Returns `false` once
/// `timeout` has passed; a zero `timeout` polls forever.
async fn wait_visible(page: &Page, selector: &str, timeout: Duration) -> Result<bool> {
    let script = visibility_script(selector);
    let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

    loop {
        let visible = page
            .evaluate(script.as_str())
            .await
            .map_err(cdp_error)?
            .into_value::<bool>()
            .map_err(cdp_error)?;
        if visible {
            return Ok(true);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(false);
        }
        sleep(SELECTOR_POLL_INTERVAL).await;
    }
}

/// Script that reports whether `selector` matches a rendered, visible
/// element. The selector is embedded as `\uXXXX` escapes so no input can
/// break out of the string literal.
fn visibility_script(selector: &str) -> String {
    let literal: String = selector
        .encode_utf16()
        .map(|unit| format!("\\u{unit:04x}"))
        .collect();
    format!(
        "(() => {{ \
            const el = document.querySelector(\"{literal}\"); \
            if (!el) return false; \
            const style = window.getComputedStyle(el); \
            if (style.display === 'none' || style.visibility === 'hidden') return false; \
            const rect = el.getBoundingClientRect(); \
            return rect.width > 0 || rect.height > 0; \
        }})()"
    )
}
