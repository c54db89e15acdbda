use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(super) server: ServerSettings,
    pub(super) runtime: RuntimeSettings,
    pub(super) challenge: ChallengeSettings,
    pub(super) paths: PathSettings,
    pub(super) store: StoreSettings,
    pub(super) database: DatabaseSettings,
    pub(super) redis: RedisSettings,
    pub(super) grading: GradingSettings,
    pub(super) services: Vec<ServiceDescriptor>,
    pub(super) startup: StartupSettings,
    pub(super) telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerSettings {
    pub(super) host: ServerHost,
    pub(super) port: ServerPort,
}

#[derive(Debug, Clone)]
pub(crate) struct ChallengeSettings {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) support_code: String,
}

#[derive(Debug, Clone)]
pub(crate) struct PathSettings {
    pub(crate) custom_script_dir: PathBuf,
    pub(crate) token_dir: PathBuf,
    pub(crate) upload_dir: PathBuf,
    pub(crate) script_interpreter: String,
    pub(crate) script_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub(crate) struct StoreSettings {
    pub(crate) backend: StoreBackend,
}

#[derive(Debug, Clone)]
pub(crate) struct DatabaseSettings {
    pub(crate) postgres_server: String,
    pub(crate) postgres_port: u16,
    pub(crate) postgres_user: String,
    pub(crate) postgres_password: String,
    pub(crate) postgres_db: String,
    pub(crate) database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct RedisSettings {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) db: u16,
    pub(crate) password: String,
    pub(crate) key_prefix: String,
}

#[derive(Debug, Clone)]
pub(crate) struct TelemetrySettings {
    pub(crate) log_level: String,
    pub(crate) json: bool,
    pub(crate) prometheus_enabled: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub(crate) environment: Environment,
    pub(crate) strict_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Everything the grading engine needs from configuration, validated at load time.
#[derive(Debug, Clone)]
pub(crate) struct GradingSettings {
    pub(crate) enabled: bool,
    pub(crate) parts: GradingParts,
    pub(crate) manual_script: Option<String>,
    pub(crate) cron: Option<CronSettings>,
    pub(crate) rate_limit: Duration,
    pub(crate) phases: Option<PhasePlan>,
    pub(crate) token_location: TokenLocation,
    pub(crate) submission: SubmissionSettings,
}

impl GradingSettings {
    pub(crate) fn manual_enabled(&self) -> bool {
        self.manual_script.is_some()
    }

    pub(crate) fn cron_enabled(&self) -> bool {
        self.cron.is_some()
    }

    pub(crate) fn grader_post(&self) -> bool {
        self.submission.method == SubmissionMethod::GraderPost
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CronSettings {
    pub(crate) script: String,
    pub(crate) interval: Duration,
    /// `None` runs forever.
    pub(crate) limit: Option<u64>,
    pub(crate) delay: Duration,
    pub(crate) at: Option<CronAt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CronAt {
    pub(crate) hour: u8,
    pub(crate) minute: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenLocation {
    Env,
    Redis,
    File,
}

impl TokenLocation {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::Redis => "redis",
            Self::File => "file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmissionMethod {
    Display,
    GraderPost,
}

#[derive(Debug, Clone)]
pub(crate) struct SubmissionSettings {
    pub(crate) method: SubmissionMethod,
    pub(crate) grader_url: String,
    pub(crate) grader_key: String,
}

#[derive(Debug, Clone)]
pub(crate) struct GradingPart {
    pub(crate) label: String,
    pub(crate) text: String,
    pub(crate) token_name: String,
    pub(crate) kind: PartKind,
}

/// Mode of a grading part. Mode-specific fields live on the variant.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub(crate) enum PartKind {
    Button,
    Text,
    TextSingle,
    #[serde(rename = "mc", alias = "multiple_choice")]
    MultipleChoice { opts: BTreeMap<String, String> },
    Upload { upload_key: String },
    Cron,
}

impl PartKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Button => "button",
            Self::Text => "text",
            Self::TextSingle => "text_single",
            Self::MultipleChoice { .. } => "mc",
            Self::Upload { .. } => "upload",
            Self::Cron => "cron",
        }
    }

    pub(crate) fn is_manual(&self) -> bool {
        !matches!(self, Self::Cron)
    }

    pub(crate) fn is_cron(&self) -> bool {
        matches!(self, Self::Cron)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct GradingParts(pub(super) BTreeMap<String, GradingPart>);

impl GradingParts {
    pub(crate) fn get(&self, label: &str) -> Option<&GradingPart> {
        self.0.get(label)
    }

    pub(crate) fn contains(&self, label: &str) -> bool {
        self.0.contains_key(label)
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &GradingPart> {
        self.0.values()
    }

    /// Labels sorted case-insensitively.
    pub(crate) fn question_order(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.0.keys().cloned().collect();
        labels.sort_by_key(|label| label.to_lowercase());
        labels
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PhasePlan {
    pub(super) order: Vec<String>,
    pub(super) members: BTreeMap<String, Vec<String>>,
}

impl PhasePlan {
    pub(crate) fn order(&self) -> &[String] {
        &self.order
    }

    pub(crate) fn members(&self, phase: &str) -> &[String] {
        self.members.get(phase).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn is_terminal(&self, phase: &str) -> bool {
        self.order.last().is_some_and(|last| last == phase)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServiceDescriptor {
    pub(crate) name: String,
    pub(crate) host: String,
    pub(crate) check: ServiceCheck,
    pub(crate) blocking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServiceCheck {
    Ping,
    Socket { port: u16 },
    Web { port: u16, path: String },
}

impl ServiceCheck {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Socket { .. } => "socket",
            Self::Web { .. } => "web",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StartupSettings {
    pub(crate) scripts: Vec<String>,
    pub(crate) port_checker: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerHost(pub(super) String);

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerPort(pub(super) u16);

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid server host: {0}")]
    InvalidHost(String),
    #[error("invalid server port: {0}")]
    InvalidPort(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
    #[error("failed to read challenge config {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse challenge config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid challenge config: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("invalid challenge config: {0}")]
    Invalid(String),
}

impl DatabaseSettings {
    pub(crate) fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }

        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_server,
            self.postgres_port,
            self.postgres_db
        )
    }
}

impl RedisSettings {
    pub(crate) fn redis_url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

impl ServerHost {
    pub(super) fn parse(value: String) -> Result<Self, ConfigError> {
        if value.trim().is_empty() || value.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::InvalidHost(value));
        }

        Ok(Self(value))
    }
}

impl ServerPort {
    pub(super) fn parse(value: String) -> Result<Self, ConfigError> {
        let parsed: u16 = value.parse().map_err(|_| ConfigError::InvalidPort(value.clone()))?;
        if parsed == 0 {
            return Err(ConfigError::InvalidPort(value));
        }

        Ok(Self(parsed))
    }
}
