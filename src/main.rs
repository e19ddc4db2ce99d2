use axum::{
    Router,
    routing::{get, post},
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use generation_gateway::config::Args;
use generation_gateway::{
    AdmissionPipeline, GatewayConfig, LoadGate, RateLimiter, TimeoutExecutor,
};

mod handlers;
mod load_balancer;
mod models;
mod state;

use handlers::{generate_handler, health_handler, metrics_handler, status_handler};
use load_balancer::{LoadBalancer, health_checker};
use state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %e, "gateway stopped");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_args(&args)?;

    // each stage is built once here and shared by reference
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone())?);
    let load_gate = Arc::new(LoadGate::new(config.load_gate.clone()));
    let executor = Arc::new(TimeoutExecutor::new(config.executor.clone()));
    let pipeline = AdmissionPipeline::new(
        Arc::clone(&rate_limiter),
        Arc::clone(&load_gate),
        Arc::clone(&executor),
        config.max_wait,
    );

    let load_balancer = Arc::new(LoadBalancer::new(&args.backends)?);
    let client = reqwest::Client::new();

    tokio::spawn(health_checker(
        Arc::clone(&load_balancer),
        client.clone(),
        Duration::from_secs(args.health_interval),
    ));
    tokio::spawn(sweeper(
        Arc::clone(&rate_limiter),
        Arc::clone(&executor),
        Duration::from_secs(args.sweep_interval),
    ));

    let state = Arc::new(AppState::new(
        client,
        load_balancer,
        pipeline,
        config.load_gate.cores,
    ));

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/generate", post(generate_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        %addr,
        cpu_max = config.load_gate.cpu_max,
        cpu_critical = config.load_gate.cpu_critical,
        generation_timeout_secs = config.executor.default_timeout.as_secs(),
        max_wait_secs = config.max_wait.as_secs(),
        "gateway listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("gateway shut down");
    Ok(())
}

// Drops idle rate-limit windows, expired blocks and stale history
async fn sweeper(
    rate_limiter: Arc<RateLimiter>,
    executor: Arc<TimeoutExecutor>,
    every: Duration,
) {
    let mut ticker = interval(every);
    loop {
        ticker.tick().await;
        let keys = rate_limiter.sweep();
        let records = executor.prune_history();
        if keys + records > 0 {
            info!(keys, records, "swept idle admission state");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
