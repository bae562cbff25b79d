#![doc = include_str!("../README.md")]

mod server;

use anyhow::Context;
use clap::Parser;
use precrawl::{Dispatcher, PageAllocator, PagePool, Renderer, TaskQueue};
use server::config::{CliArgs, ServerConfig};
use server::gateway::{Gateway, GatewaySettings};
use server::telemetry::init_telemetry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    init_telemetry(config.log_format)?;

    #[cfg(feature = "chromium")]
    {
        use server::chromium::{ChromiumAllocator, ChromiumOptions, ChromiumRenderer};

        let allocator = ChromiumAllocator::launch(ChromiumOptions::from(&config)).await?;
        let pool = Arc::new(
            PagePool::new(config.pool_size, allocator)
                .await
                .context("failed to open browser tabs")?,
        );

        let res = run_server(&config, Arc::clone(&pool), ChromiumRenderer).await;

        pool.close();
        pool.allocator().shutdown().await;
        res
    }

    #[cfg(not(feature = "chromium"))]
    {
        anyhow::bail!("built without a browser backend, enable the `chromium` feature")
    }
}

/// Serves the gateway until a shutdown signal arrives or the listener fails,
/// then drains requests and stops the workers. The pool is left open for the
/// caller to close.
async fn run_server<A, R>(
    config: &ServerConfig,
    pool: Arc<PagePool<A>>,
    renderer: R,
) -> anyhow::Result<()>
where
    A: PageAllocator,
    R: Renderer<A::Page>,
{
    let queue = Arc::new(TaskQueue::new());
    let dispatcher = Dispatcher::spawn(
        config.num_workers,
        Arc::clone(&queue),
        pool,
        Arc::new(renderer),
    );

    let gateway = Gateway::new(GatewaySettings::from(config), queue);
    let listener = TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server_addr))?;
    log_startup_info(&config.server_addr, config);

    let stop = CancellationToken::new();
    let serve = axum::serve(listener, gateway.clone().router())
        .with_graceful_shutdown(stop.clone().cancelled_owned());
    let mut server: JoinHandle<std::io::Result<()>> = tokio::spawn(async move { serve.await });

    let served = tokio::select! {
        () = shutdown_signal() => {
            tracing::info!("Shutdown signal received, terminating gracefully...");
            stop.cancel();
            drain(&mut server, &gateway, config).await
        }
        joined = &mut server => {
            tracing::warn!("Server stopped without a shutdown signal");
            joined.context("server task failed")?.context("server error")
        }
    };

    // 1. Stop workers; in-flight renders get the same grace.
    let aborted = dispatcher.shutdown(config.shutdown_timeout).await;
    if aborted > 0 {
        tracing::warn!("{aborted} workers aborted during shutdown");
    }

    // 2. Make sure nothing is left waiting on a result.
    gateway.cancel_pending();

    tracing::info!("Service shut down successfully");
    served
}

/// Waits for in-flight requests to finish. After the grace period pending
/// requests are answered with `408`, and after a second one the server task
/// is aborted.
async fn drain(
    server: &mut JoinHandle<std::io::Result<()>>,
    gateway: &Gateway,
    config: &ServerConfig,
) -> anyhow::Result<()> {
    if let Ok(joined) = timeout(config.shutdown_timeout, &mut *server).await {
        return joined.context("server task failed")?.context("server error");
    }

    tracing::warn!("In-flight requests outlived the grace period, cancelling them");
    gateway.cancel_pending();

    match timeout(config.shutdown_timeout, &mut *server).await {
        Ok(joined) => joined.context("server task failed")?.context("server error"),
        Err(_) => {
            tracing::error!("Server did not stop, aborting");
            server.abort();
            Ok(())
        }
    }
}

fn log_startup_info(addr: &str, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting prerender service on {} with full config: {:#?}",
            addr,
            config
        );
    } else {
        tracing::info!(
            "Starting prerender service on {} for {} with {} workers and {} pages",
            addr,
            config.base_url,
            config.num_workers,
            config.pool_size
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
