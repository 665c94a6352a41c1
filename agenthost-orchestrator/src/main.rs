use std::sync::Arc;

use agenthost_orchestrator::config::Settings;
use agenthost_orchestrator::store::{InstanceStore, MemoryInstanceStore, PgInstanceStore};
use agenthost_orchestrator::{api, build_registry, build_state};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;

    let store: Arc<dyn InstanceStore> = match &settings.database_url {
        Some(url) if !settings.use_memory_store => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("failed to connect to Postgres")?;
            sqlx::migrate!("../sqlx-migrations")
                .run(&pool)
                .await
                .context("failed to run migrations")?;
            tracing::info!("[startup] connected to database, migrations applied");
            Arc::new(PgInstanceStore::new(pool))
        }
        _ => {
            tracing::warn!("[startup] STORE=memory: instance records are lost on restart");
            Arc::new(MemoryInstanceStore::new())
        }
    };

    let registry = build_registry(&settings)?;
    tracing::info!(
        "[startup] providers: {}",
        registry
            .kinds()
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let state = build_state(&settings, store, registry, None)?;
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    tracing::info!("[startup] orchestrator listening on {}", settings.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
