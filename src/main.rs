use clap::Parser; // for cli
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use medical_report_gateway::config::Args;
use medical_report_gateway::{GatewayError, Result, ServerContext, router};

const DEFAULT_FILTER: &str = "medical_report_gateway=info,tower_http=info";

fn main() {
    // parse cli arguments (flags or environment)
    let args = Args::parse();
    let _guard = init_logging(&args);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.max_workers.max(1))
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(args)) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

// stderr always; JSON lines to a file when LOG_FILE is set
fn init_logging(args: &Args) -> Option<WorkerGuard> {
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file_layer, guard) = match &args.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(std::path::Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "medical_server.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

async fn serve(args: Args) -> Result<()> {
    // a missing credential stops the process here
    let ctx = Arc::new(ServerContext::from_args(&args)?);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Configuration(format!("bind {addr}: {e}")))?;

    tracing::info!("Gateway running on http://localhost:{}", args.port);
    tracing::info!(
        "vision model {} at {}, text model {} at {}",
        ctx.vision.model,
        ctx.vision.base_url,
        ctx.text.model,
        ctx.text.base_url
    );
    tracing::info!(
        "max image edge: {}px, api timeout: {}s, max attempts: {}, cache: {}",
        args.max_image_size,
        args.api_timeout,
        ctx.client.max_attempts(),
        match &ctx.cache {
            Some(cache) => format!("{} entries, ttl {}s", cache.capacity(), args.cache_ttl),
            None => "disabled".to_string(),
        }
    );

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::Internal(format!("server: {e}")))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown signal received");
    }
}
