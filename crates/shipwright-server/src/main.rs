use std::{sync::Arc, time::Instant};

use axum::{
    routing::{get, post},
    Router,
};
use shipwright_core::{
    build::BuildDriver,
    checkout::CheckoutManager,
    config::Config,
    git::Git,
    notify::{LogNotifier, Notifier, SlackWebhook},
    report::Reporter,
    run::RunDriver,
    toolchain::DockerCli,
    worker::{Orchestrator, Worker},
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod routes;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shipwright_server=info,shipwright_core=info".into()),
        )
        .init();

    let config = Arc::new(Config::from_env()?);

    let worker = build_worker(&config).await;
    let state = Arc::new(AppState {
        orchestrator: Orchestrator::start(worker),
        config: Arc::clone(&config),
        start_time: Instant::now(),
    });

    let app = router(Arc::clone(&state));

    let addr = config.listen_addr();
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, waiting for the in-flight task");
    state.orchestrator.stop().await;
    Ok(())
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/status", get(routes::get_status))
        .route("/hooks/chat", post(routes::chat_hook))
        .route("/hooks/github", post(routes::github_hook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire the worker's collaborators from configuration.
pub(crate) async fn build_worker(config: &Config) -> Worker {
    let git = Git::new(&config.git_bin);
    if !git.available().await {
        warn!(git_bin = %config.git_bin, "git not found; checkouts will fail");
    }
    let docker = DockerCli::new(&config.docker_bin);
    if !docker.available().await {
        warn!(docker_bin = %config.docker_bin, "container daemon unreachable; builds will fail");
    }
    let docker = Arc::new(docker);

    let notifier: Arc<dyn Notifier> = if config.slack_webhook_url.is_empty() {
        info!("SLACK_WEBHOOK_URL not set, notifications go to the log");
        Arc::new(LogNotifier)
    } else {
        Arc::new(
            SlackWebhook::new(&config.slack_webhook_url, &config.slack_username)
                .with_icon_url(&config.slack_icon_url)
                .with_timeout(config.notify_timeout()),
        )
    };

    Worker::new(
        CheckoutManager::new(Arc::new(git), &config.workspace_dir),
        BuildDriver::new(docker.clone()).with_no_cache(config.build_no_cache),
        RunDriver::new(docker)
            .with_timeout(config.run_timeout())
            .with_grace(config.run_grace()),
        Reporter::new(notifier).with_timeout(config.notify_timeout()),
    )
    .with_default_host(&config.git_default_host)
    .with_command_prefix(&config.command_prefix)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
