pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use crate::core::config::{Settings, StoreBackend, TokenLocation};
use crate::core::redis::RedisHandle;
use crate::core::shutdown::{cancelled, shutdown_signal, ShutdownTrigger};
use crate::core::state::{AppState, Collaborators};
use crate::core::telemetry;
use crate::core::time::SystemClock;
use crate::db::types::EventKind;
use crate::repositories::store::{MemoryRecordStore, PgRecordStore, RecordStore};
use crate::services::availability::NetworkProbe;
use crate::services::script_runner::ProcessScriptRunner;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let store: Arc<dyn RecordStore> = match settings.store().backend {
        StoreBackend::Postgres => {
            let pool = db::init_pool(&settings).await.context("failed to connect to PostgreSQL")?;
            db::run_migrations(&pool).await.context("failed to run migrations")?;
            Arc::new(PgRecordStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory record store; state will not survive a restart");
            Arc::new(MemoryRecordStore::new())
        }
    };

    let redis = RedisHandle::new(settings.redis().redis_url());
    if settings.grading().token_location == TokenLocation::Redis {
        if let Err(err) = redis.connect().await {
            tracing::error!(error = %err, "Failed to connect to Redis; token lookups will fail");
        } else {
            tracing::info!("Redis connected successfully");
        }
    }

    let collaborators = Collaborators {
        store,
        redis: redis.clone(),
        runner: Arc::new(ProcessScriptRunner::new(settings.paths())),
        probe: Arc::new(NetworkProbe::new()?),
        clock: Arc::new(SystemClock),
    };
    let state = AppState::build(settings, collaborators)?;

    if state.registry().initialize().await.context("failed to seed question records")? {
        state
            .events()
            .record_or_log(
                EventKind::ChallengeStarted,
                json!({ "parts": state.registry().parts().len() }),
            )
            .await;
    }
    state
        .events()
        .seed_submission_counter()
        .await
        .context("failed to seed the submission counter")?;

    let (trigger, mut shutdown) = ShutdownTrigger::new();
    let background = tokio::spawn(tasks::scheduler::run(state.clone(), trigger.clone()));

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr())
        .await
        .with_context(|| format!("failed to bind {}", state.settings().server_addr()))?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        challenge = %state.settings().challenge().name,
        environment = %state.settings().runtime().environment.as_str(),
        "Challenge server listening"
    );

    let server_trigger = trigger.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {},
                _ = cancelled(&mut shutdown) => {},
            }
            server_trigger.trigger();
        })
        .await;

    trigger.trigger();
    let background_result = match background.await {
        Ok(result) => result,
        Err(err) => Err(anyhow::anyhow!("background scheduler panicked: {err}")),
    };

    redis.disconnect().await;
    tracing::info!("Redis disconnected");

    result?;
    background_result?;

    Ok(())
}
