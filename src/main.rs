use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{Method, StatusCode};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::admission::{CustomResolvers, LimitCallback, LimitCallbacks, PolicySet, ScopeFn};
use turnstile::config::TurnstileConfig;
use turnstile::pipeline::{handler_fn, Pipeline, Reply, RequestContext};
use turnstile::server::HttpServer;
use turnstile::store::SystemClock;

/// Request admission service.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Worker threads, overriding the configuration
    #[arg(long)]
    workers: Option<usize>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Turnstile Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => TurnstileConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => TurnstileConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(workers) = args.workers {
        config.server.workers = workers;
    }
    config.validate()?;
    info!(
        bind_addr = %config.server.bind_addr,
        workers = config.server.workers,
        connection_limits = config.connection_limits.len(),
        rate_limits = config.rate_limits.len(),
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers)
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(run(config))?;

    info!("Turnstile Admission Service stopped");
    Ok(())
}

async fn run(config: TurnstileConfig) -> anyhow::Result<()> {
    let policies = PolicySet::from_config(
        &config,
        &custom_resolvers(),
        &limit_callbacks(),
        Arc::new(SystemClock::new()),
    )?;

    let pipeline = policies
        .install(Pipeline::builder())
        .route(
            Method::GET,
            "/health",
            handler_fn(|ctx| {
                ctx.respond_with(Reply::json(
                    StatusCode::OK,
                    &serde_json::json!({ "status": "ok" }),
                ));
                Ok(())
            }),
        )
        .build()?;

    let server = HttpServer::new(
        config.server.bind_addr,
        Arc::new(pipeline),
        config.server.max_body_bytes,
    );
    server.serve_with_shutdown(shutdown_signal()).await?;
    Ok(())
}

/// Key functions selectable by `resolver:` in custom scoped policies.
fn custom_resolvers() -> CustomResolvers {
    let mut resolvers = CustomResolvers::new();
    let api_key: ScopeFn = Arc::new(|ctx: &RequestContext| ctx.header("x-api-key").map(str::to_owned));
    resolvers.insert("api_key".to_string(), api_key);
    resolvers
}

/// Rejection callbacks selectable by `on_limit_exceeded:` in any policy.
fn limit_callbacks() -> LimitCallbacks {
    let mut callbacks = LimitCallbacks::new();
    let drop_connection: LimitCallback = Arc::new(|ctx: &mut RequestContext| ctx.abort_connection());
    callbacks.insert("drop_connection".to_string(), drop_connection);
    callbacks
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
