use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use prompt_arena::config::{self, Config};
use prompt_arena::handlers::{self, AppState};
use prompt_arena::storage::{MemRepository, Repository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("prompt_arena=info".parse()?),
        )
        .init();

    let config = Config::from_env();
    config.print_banner();

    let repo = Arc::new(MemRepository::new());
    if let Some(path) = &config.criteria_file {
        let seeds = config::load_criteria_seed(path)?;
        for seed in seeds {
            let criterion = repo.create_criterion(seed);
            info!(id = criterion.id, name = %criterion.name, "Seeded criterion");
        }
    }

    let port = config.port;
    let state = Arc::new(AppState::new(config, repo));

    let runs_reaper = state.runs.clone();
    tokio::spawn(async move {
        runs_reaper.reaper_loop().await;
    });

    let app = handlers::router(state).layer(
        tower::ServiceBuilder::new()
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .layer(tower_http::cors::CorsLayer::permissive()),
    );

    let addr = format!("0.0.0.0:{}", port);
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, draining...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
