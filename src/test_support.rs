use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    response::Response,
};
use tempfile::TempDir;
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::core::config::{GradingSettings, ServiceDescriptor, Settings};
use crate::core::redis::RedisHandle;
use crate::core::state::{AppState, Collaborators, RuntimeFlags};
use crate::core::time::Clock;
use crate::repositories::store::{MemoryRecordStore, RecordStore};
use crate::schemas::grading::ResultsView;
use crate::services::availability::ServiceProbe;
use crate::services::events::EventLog;
use crate::services::notifier::{SolveNotice, SolveNotifier};
use crate::services::registry::Registry;
use crate::services::script_runner::{ScriptError, ScriptOutput, ScriptRunner};
use crate::tasks::grading::{results_view, GradingEngine, ManualCoordinator, ResultBoard};

pub(crate) const MANUAL_CHALLENGE: &str = r#"
challenge_name = "Manual Challenge"

[grading]
enabled = true
manual_grading = true
manual_grading_script = "grade.py"
rate_limit = 30

[grading.parts.GradingCheck1]
mode = "text"
text = "Find the flag"
token_name = "token1"

[grading.parts.GradingCheck2]
mode = "button"
text = "Restart the service"
token_name = "token2"

[grading.parts.GradingCheck3]
mode = "mc"
text = "Which port is exposed?"
token_name = "token3"
opts = { a = "Port 22", b = "Port 80" }

[grading.parts.GradingCheck4]
mode = "upload"
text = "Upload the packet capture"
token_name = "token4"
upload_key = "capture"
"#;

pub(crate) const CRON_CHALLENGE: &str = r#"
challenge_name = "Cron Challenge"

[grading]
enabled = true
manual_grading = true
manual_grading_script = "grade.py"
cron_grading = true
cron_grading_script = "cron.sh"
cron_interval = 5
cron_limit = 2
cron_delay = 0

[grading.parts.CronCheck1]
mode = "cron"
text = "Keep the web server patched"
token_name = "cron1"

[grading.parts.CronCheck2]
mode = "cron"
text = "Keep the firewall up"
token_name = "cron2"

[grading.parts.GradingCheck1]
mode = "text"
text = "Find the flag"
token_name = "token1"
"#;

pub(crate) const GATED_CHALLENGE: &str = r#"
challenge_name = "Gated Challenge"

[[required_services]]
name = "db"
host = "10.5.5.5"
type = "ping"
block_startup_scripts = true

[[required_services]]
name = "web"
host = "10.5.5.6"
type = "web"
port = 8080
path = "/health"

[startup]
scripts = ["setup.sh"]
"#;

const OVERRIDE_VARS: &[&str] = &[
    "CS_CONFIG_PATH",
    "CS_SUPPORT_CODE",
    "CS_CHALLENGE_NAME",
    "CS_GRADING_ENABLED",
    "CS_MANUAL_GRADING",
    "CS_CRON_GRADING",
    "CS_MANUAL_GRADING_SCRIPT",
    "CS_CRON_GRADING_SCRIPT",
    "CS_GRADING_RATE_LIMIT",
    "CS_TOKEN_LOCATION",
    "CS_SUBMISSION_METHOD",
    "CS_GRADER_POST",
    "CS_GRADER_URL",
    "CS_GRADER_KEY",
    "CS_CRON_INTERVAL",
    "CS_CRON_LIMIT",
    "CS_CRON_DELAY",
    "CS_CRON_AT",
    "CS_PORT_CHECKER",
];

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

/// Points every filesystem setting at `dir` and clears challenge overrides.
pub(crate) fn set_test_env(dir: &Path) {
    std::env::set_var("CS_ENV", "test");
    std::env::set_var("CS_STRICT_CONFIG", "0");
    std::env::set_var("CS_STORE", "memory");
    std::env::set_var("CS_CHALLENGE_ID", "test-challenge");
    std::env::set_var("CS_CUSTOM_SCRIPT_DIR", dir.join("custom_scripts"));
    std::env::set_var("CS_TOKEN_DIR", dir.join("tokens"));
    std::env::set_var("CS_UPLOAD_DIR", dir.join("uploads"));
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    for key in OVERRIDE_VARS {
        std::env::remove_var(key);
    }
}

/// Replays canned stdout and records every invocation.
pub(crate) struct FakeScriptRunner {
    stdout: Mutex<String>,
    exit_code: i32,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeScriptRunner {
    pub(crate) fn replying(stdout: &str) -> Self {
        Self::exiting(0, stdout)
    }

    pub(crate) fn exiting(exit_code: i32, stdout: &str) -> Self {
        Self {
            stdout: Mutex::new(stdout.to_string()),
            exit_code,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) async fn set_stdout(&self, stdout: &str) {
        *self.stdout.lock().await = stdout.to_string();
    }

    pub(crate) async fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl ScriptRunner for FakeScriptRunner {
    async fn invoke(&self, script: &str, args: &[String]) -> Result<ScriptOutput, ScriptError> {
        self.calls.lock().await.push((script.to_string(), args.to_vec()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ScriptOutput {
            exit_code: Some(self.exit_code),
            stdout: self.stdout.lock().await.clone(),
            stderr: String::new(),
            elapsed: self.delay.unwrap_or_default(),
        })
    }
}

/// Answers checks from a script; the last answer repeats forever.
pub(crate) struct FakeProbe {
    answers: std::sync::Mutex<VecDeque<bool>>,
    checks: AtomicUsize,
}

impl FakeProbe {
    pub(crate) fn scripted(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: std::sync::Mutex::new(answers.into_iter().collect()),
            checks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceProbe for FakeProbe {
    async fn check(&self, _service: &ServiceDescriptor) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock().expect("probe answers");
        if answers.len() > 1 {
            answers.pop_front().unwrap_or(false)
        } else {
            answers.front().copied().unwrap_or(false)
        }
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    notices: Mutex<Vec<SolveNotice>>,
}

impl RecordingNotifier {
    pub(crate) async fn notices(&self) -> Vec<SolveNotice> {
        self.notices.lock().await.clone()
    }
}

#[async_trait]
impl SolveNotifier for RecordingNotifier {
    async fn notify(&self, notice: &SolveNotice) {
        self.notices.lock().await.push(notice.clone());
    }
}

/// A clock that only moves when told to.
pub(crate) struct ManualClock {
    now: std::sync::Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self { now: std::sync::Mutex::new(datetime!(2024-05-01 12:00 UTC)) }
    }

    pub(crate) fn advance(&self, by: time::Duration) {
        let mut now = self.now.lock().expect("clock");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().expect("clock")
    }
}

pub(crate) fn registry(
    grading: &GradingSettings,
) -> (Registry, Arc<MemoryRecordStore>, Arc<RecordingNotifier>) {
    let store = Arc::new(MemoryRecordStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let challenge = crate::core::config::ChallengeSettings {
        id: "test-challenge".to_string(),
        name: "Test Challenge".to_string(),
        support_code: "test-cha".to_string(),
    };
    let events = EventLog::new(store.clone(), &challenge);
    let registry =
        Registry::new(store.clone(), grading, notifier.clone(), events, Arc::new(ManualClock::new()));
    (registry, store, notifier)
}

/// A fully wired [`AppState`] over in-memory collaborators, with its registry seeded.
pub(crate) struct Harness {
    pub(crate) state: AppState,
    pub(crate) engine: Arc<GradingEngine>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) flags: Arc<RuntimeFlags>,
    pub(crate) board: Arc<ResultBoard>,
    pub(crate) store: Arc<MemoryRecordStore>,
    pub(crate) runner: Arc<FakeScriptRunner>,
    pub(crate) probe: Arc<FakeProbe>,
    pub(crate) clock: Arc<ManualClock>,
    _dir: TempDir,
}

impl Harness {
    /// A coordinator sharing the harness engine, board and clock.
    pub(crate) fn coordinator(&self) -> ManualCoordinator {
        ManualCoordinator::new(
            self.engine.clone(),
            self.board.clone(),
            self.clock.clone(),
            self.state.settings().grading().rate_limit,
        )
    }

    pub(crate) async fn results_view(&self) -> ResultsView {
        results_view(
            &self.registry,
            &self.board,
            self.state.tokens(),
            self.state.settings().grading(),
            self.flags.fatal(),
        )
        .await
        .expect("results view")
    }
}

pub(crate) async fn harness(raw_toml: &str, runner: FakeScriptRunner) -> Harness {
    harness_with(raw_toml, runner, FakeProbe::scripted([true])).await
}

pub(crate) async fn harness_with(
    raw_toml: &str,
    runner: FakeScriptRunner,
    probe: FakeProbe,
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::for_tests(raw_toml, dir.path());

    let token_dir = &settings.paths().token_dir;
    std::fs::create_dir_all(token_dir).expect("token dir");
    for part in settings.grading().parts.iter() {
        std::fs::write(token_dir.join(&part.token_name), format!("tok-{}\n", part.token_name))
            .expect("token file");
    }

    let store = Arc::new(MemoryRecordStore::new());
    let runner = Arc::new(runner);
    let probe = Arc::new(probe);
    let clock = Arc::new(ManualClock::new());
    let state = AppState::build(
        settings,
        Collaborators {
            store: store.clone() as Arc<dyn RecordStore>,
            redis: RedisHandle::new("redis://127.0.0.1:6379/0".to_string()),
            runner: runner.clone(),
            probe: probe.clone(),
            clock: clock.clone(),
        },
    )
    .expect("app state");
    state.registry().initialize().await.expect("seed registry");
    state.events().seed_submission_counter().await.expect("seed submission counter");

    Harness {
        engine: state.engine().clone(),
        registry: state.registry().clone(),
        flags: state.flags().clone(),
        board: state.board().clone(),
        state,
        store,
        runner,
        probe,
        clock,
        _dir: dir,
    }
}

pub(crate) fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub(crate) async fn read_json(response: Response) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&body).expect("json")
}

