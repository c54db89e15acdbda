use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::core::{config::Settings, redis::RedisHandle, time::Clock};
use crate::repositories::store::RecordStore;
use crate::services::availability::ServiceProbe;
use crate::services::events::EventLog;
use crate::services::grader_client::GraderClient;
use crate::services::notifier::EventLogNotifier;
use crate::services::registry::Registry;
use crate::services::script_runner::ScriptRunner;
use crate::services::tokens::{backend_for, TokenDispenser};
use crate::tasks::grading::{GradingEngine, ManualCoordinator, ResultBoard};
use crate::tasks::monitor::ServiceBoard;

/// Process-wide scalar flags. Single writer per flag, read from anywhere.
#[derive(Debug, Default)]
pub(crate) struct RuntimeFlags {
    fatal_error: AtomicBool,
    server_ready: AtomicBool,
}

impl RuntimeFlags {
    pub(crate) fn fatal(&self) -> bool {
        self.fatal_error.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fatal(&self, value: bool) {
        self.fatal_error.store(value, Ordering::SeqCst);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.server_ready.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_ready(&self) {
        self.server_ready.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    store: Arc<dyn RecordStore>,
    redis: RedisHandle,
    flags: Arc<RuntimeFlags>,
    events: EventLog,
    registry: Arc<Registry>,
    tokens: TokenDispenser,
    engine: Arc<GradingEngine>,
    manual: ManualCoordinator,
    board: Arc<ResultBoard>,
    services: Arc<ServiceBoard>,
    runner: Arc<dyn ScriptRunner>,
    probe: Arc<dyn ServiceProbe>,
    clock: Arc<dyn Clock>,
}

/// Collaborators that differ between production and tests.
pub(crate) struct Collaborators {
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) redis: RedisHandle,
    pub(crate) runner: Arc<dyn ScriptRunner>,
    pub(crate) probe: Arc<dyn ServiceProbe>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wires the grading components once, at the composition root.
    pub(crate) fn build(settings: Settings, collaborators: Collaborators) -> Result<Self> {
        let Collaborators { store, redis, runner, probe, clock } = collaborators;
        let grading = settings.grading();
        let flags = Arc::new(RuntimeFlags::default());
        let events = EventLog::new(store.clone(), settings.challenge());

        let notifier = Arc::new(EventLogNotifier::new(events.clone()));
        let registry = Arc::new(Registry::new(
            store.clone(),
            grading,
            notifier,
            events.clone(),
            clock.clone(),
        ));

        let backend = backend_for(
            grading.token_location,
            redis.clone(),
            &settings.redis().key_prefix,
            settings.paths().token_dir.clone(),
        );
        let tokens =
            TokenDispenser::new(grading.parts.clone(), backend, flags.clone(), grading.grader_post());

        let grader = if grading.enabled && grading.grader_post() {
            Some(GraderClient::new(&grading.submission, &settings.challenge().id, flags.clone())?)
        } else {
            None
        };

        let engine = Arc::new(GradingEngine::new(
            registry.clone(),
            runner.clone(),
            tokens.clone(),
            grader,
            flags.clone(),
            events.clone(),
            grading,
            settings.paths().upload_dir.clone(),
        ));
        let board = Arc::new(ResultBoard::default());
        let manual =
            ManualCoordinator::new(engine.clone(), board.clone(), clock.clone(), grading.rate_limit);
        let services = Arc::new(ServiceBoard::new(settings.services()));

        Ok(Self {
            inner: Arc::new(InnerState {
                settings,
                store,
                redis,
                flags,
                events,
                registry,
                tokens,
                engine,
                manual,
                board,
                services,
                runner,
                probe,
                clock,
            }),
        })
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn flags(&self) -> &Arc<RuntimeFlags> {
        &self.inner.flags
    }

    pub(crate) fn events(&self) -> &EventLog {
        &self.inner.events
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub(crate) fn tokens(&self) -> &TokenDispenser {
        &self.inner.tokens
    }

    pub(crate) fn engine(&self) -> &Arc<GradingEngine> {
        &self.inner.engine
    }

    pub(crate) fn manual(&self) -> &ManualCoordinator {
        &self.inner.manual
    }

    pub(crate) fn board(&self) -> &Arc<ResultBoard> {
        &self.inner.board
    }

    pub(crate) fn services(&self) -> &Arc<ServiceBoard> {
        &self.inner.services
    }

    pub(crate) fn runner(&self) -> &Arc<dyn ScriptRunner> {
        &self.inner.runner
    }

    pub(crate) fn probe(&self) -> &Arc<dyn ServiceProbe> {
        &self.inner.probe
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }
}
