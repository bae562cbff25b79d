use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::time::Duration;
use precrawl::DEFAULT_SELECTOR;
use std::path::PathBuf;
use url::Url;

/// Runtime configuration for the `precrawl-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file in the working directory is loaded first). Durations accept
/// human-readable values such as `500ms`, `5s` or `1m 30s`.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "precrawl-server",
    version,
    about = "Prerenders pages behind a base URL with a pool of headless browser tabs"
)]
pub struct CliArgs {
    /// Base URL every request path and query is resolved against.
    ///
    /// Must carry a scheme and a host, e.g. `https://app.example.com`.
    ///
    /// Environment variable: `PRECRAWL_BASE_TARGET_URL`
    #[arg(long, env = "PRECRAWL_BASE_TARGET_URL")]
    pub base_target_url: String,

    /// CSS selector that must become visible before the HTML is captured,
    /// unless a request overrides it with `X-Render-Selector`.
    ///
    /// Environment variable: `PRECRAWL_DEFAULT_SELECTOR`
    #[arg(long, env = "PRECRAWL_DEFAULT_SELECTOR", default_value_t = String::from(DEFAULT_SELECTOR))]
    pub default_selector: String,

    /// Settle delay used when a request sends neither `X-Render-Wait` nor
    /// `X-Render-Wait-Ms`.
    ///
    /// Environment variable: `PRECRAWL_DEFAULT_WAIT`
    #[arg(long, env = "PRECRAWL_DEFAULT_WAIT", default_value = "0s", value_parser = humantime::parse_duration)]
    pub default_wait: Duration,

    /// How long to wait for the selector to become visible. On expiry the
    /// page is still captured but the request fails. `0s` waits forever.
    ///
    /// Environment variable: `PRECRAWL_RENDER_TIMEOUT`
    #[arg(long, env = "PRECRAWL_RENDER_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub render_timeout: Duration,

    /// Upper bound on how long a request waits for its result, including
    /// time spent queued. Requests running out of time get `408`.
    ///
    /// Environment variable: `PRECRAWL_REQUEST_TIMEOUT`
    #[arg(long, env = "PRECRAWL_REQUEST_TIMEOUT", value_parser = humantime::parse_duration)]
    pub request_timeout: Option<Duration>,

    /// Number of workers pulling render tasks off the queue.
    ///
    /// Environment variable: `PRECRAWL_NUM_WORKERS`
    #[arg(long, env = "PRECRAWL_NUM_WORKERS", default_value_t = 2)]
    pub num_workers: usize,

    /// Number of browser tabs kept open. Caps concurrent renders.
    ///
    /// Environment variable: `PRECRAWL_POOL_SIZE`
    #[arg(long, env = "PRECRAWL_POOL_SIZE", default_value_t = 2)]
    pub pool_size: usize,

    /// Address to listen on.
    ///
    /// Environment variable: `PRECRAWL_SERVER_ADDR`
    #[arg(long, env = "PRECRAWL_SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Grace period for in-flight requests and renders on shutdown.
    ///
    /// Environment variable: `PRECRAWL_SHUTDOWN_TIMEOUT`
    #[arg(long, env = "PRECRAWL_SHUTDOWN_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Duration,

    /// Browser binary to launch. Auto-detected when unset.
    ///
    /// Environment variable: `PRECRAWL_CHROME_EXECUTABLE`
    #[arg(long, env = "PRECRAWL_CHROME_EXECUTABLE")]
    pub chrome_executable: Option<PathBuf>,

    /// Launch the browser without its sandbox (needed in most containers).
    ///
    /// Environment variable: `PRECRAWL_NO_SANDBOX`
    #[arg(long, env = "PRECRAWL_NO_SANDBOX", default_value_t = false)]
    pub no_sandbox: bool,

    /// Log output format.
    ///
    /// Environment variable: `PRECRAWL_LOG_FORMAT`
    #[arg(long, env = "PRECRAWL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub base_url: Url,
    pub default_selector: String,
    pub default_wait: Duration,
    pub render_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub num_workers: usize,
    pub pool_size: usize,
    pub server_addr: String,
    pub shutdown_timeout: Duration,
    pub chrome_executable: Option<PathBuf>,
    pub no_sandbox: bool,
    pub log_format: LogFormat,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let base_url = parse_base_url(&args.base_target_url)?;

        if args.num_workers == 0 {
            bail!("PRECRAWL_NUM_WORKERS must be greater than 0");
        }

        if args.pool_size == 0 {
            bail!("PRECRAWL_POOL_SIZE must be greater than 0");
        }

        let default_selector = match args.default_selector.trim() {
            "" => DEFAULT_SELECTOR.to_owned(),
            selector => selector.to_owned(),
        };

        Ok(Self {
            base_url,
            default_selector,
            default_wait: args.default_wait,
            render_timeout: args.render_timeout,
            request_timeout: args.request_timeout,
            num_workers: args.num_workers,
            pool_size: args.pool_size,
            server_addr: args.server_addr,
            shutdown_timeout: args.shutdown_timeout,
            chrome_executable: args.chrome_executable,
            no_sandbox: args.no_sandbox,
            log_format: args.log_format,
        })
    }
}

/// Parses the base target URL, requiring a scheme and a host.
pub fn parse_base_url(raw: &str) -> anyhow::Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("PRECRAWL_BASE_TARGET_URL is required");
    }

    let url = Url::parse(raw).with_context(|| format!("invalid base target url `{raw}`"))?;
    if url.cannot_be_a_base() || !url.has_host() {
        bail!("base target url `{raw}` must have a scheme and a host");
    }
    Ok(url)
}
