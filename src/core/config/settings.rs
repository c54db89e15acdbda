use std::path::{Path, PathBuf};
use std::time::Duration;

use super::grading::{ChallengeFile, Overrides};
use super::parsing::{
    env_flag, env_optional, env_or_default, parse_bool, parse_environment, parse_i64,
    parse_store_backend, parse_u16, parse_u64,
};
use super::types::{
    ChallengeSettings, ConfigError, DatabaseSettings, GradingSettings, PathSettings,
    RedisSettings, RuntimeSettings, ServerHost, ServerPort, ServerSettings, ServiceDescriptor,
    Settings, StartupSettings, StoreBackend, StoreSettings, TelemetrySettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("CS_APP_HOST", "0.0.0.0");
        let port = env_or_default("CS_APP_PORT", "8888");

        let environment =
            parse_environment(env_optional("CS_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("CS_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let config_path = PathBuf::from(env_or_default("CS_CONFIG_PATH", "config.toml"));
        let raw = std::fs::read_to_string(&config_path).map_err(|source| {
            ConfigError::ReadFile { path: config_path.display().to_string(), source }
        })?;
        let resolved = ChallengeFile::from_toml(&raw)?.resolve(&read_overrides()?)?;

        let challenge_id = env_or_default("CS_CHALLENGE_ID", "local-challenge");
        let challenge_name = resolved.name.clone().unwrap_or_else(|| challenge_id.clone());
        let support_code = env_optional("CS_SUPPORT_CODE")
            .unwrap_or_else(|| challenge_id.chars().take(8).collect());

        let script_timeout =
            parse_u64("CS_GRADING_TIMEOUT", env_or_default("CS_GRADING_TIMEOUT", "600"))?;
        let paths = PathSettings {
            custom_script_dir: PathBuf::from(env_or_default("CS_CUSTOM_SCRIPT_DIR", "custom_scripts")),
            token_dir: PathBuf::from(env_or_default("CS_TOKEN_DIR", "tokens")),
            upload_dir: PathBuf::from(env_or_default("CS_UPLOAD_DIR", "uploads")),
            script_interpreter: env_or_default("CS_SCRIPT_INTERPRETER", "python3"),
            script_timeout: (script_timeout > 0).then(|| Duration::from_secs(script_timeout)),
        };

        let store = StoreSettings { backend: parse_store_backend(&env_or_default("CS_STORE", "postgres"))? };

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "challenge");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "challenge_db");
        let database_url = env_optional("DATABASE_URL");

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");
        let key_prefix = env_or_default("CS_TOKEN_KEY_PREFIX", "guestinfo.");

        let log_level = env_or_default("CS_LOG_LEVEL", "info");
        let json = env_flag("CS_LOG_JSON").unwrap_or(false);
        let prometheus_enabled = env_flag("PROMETHEUS_ENABLED").unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            challenge: ChallengeSettings { id: challenge_id, name: challenge_name, support_code },
            paths,
            store,
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
                key_prefix,
            },
            grading: resolved.grading,
            services: resolved.services,
            startup: resolved.startup,
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn challenge(&self) -> &ChallengeSettings {
        &self.challenge
    }

    pub(crate) fn paths(&self) -> &PathSettings {
        &self.paths
    }

    pub(crate) fn store(&self) -> &StoreSettings {
        &self.store
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub(crate) fn startup(&self) -> &StartupSettings {
        &self.startup
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let scripts = self
            .grading
            .manual_script
            .iter()
            .chain(self.grading.cron.as_ref().map(|cron| &cron.script))
            .chain(self.startup.scripts.iter());
        for script in scripts {
            let path = self.paths.custom_script_dir.join(script);
            if !is_runnable(&path) {
                return Err(ConfigError::InvalidValue {
                    field: "script",
                    value: path.display().to_string(),
                });
            }
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.store.backend == StoreBackend::Postgres
            && self.database.database_url.is_none()
            && self.database.postgres_password.is_empty()
        {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        Ok(())
    }
}

// Interpreted scripts only need to exist; anything else must carry an exec bit.
fn is_runnable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    if path.extension().is_some_and(|ext| ext == "py") {
        return true;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn read_overrides() -> Result<Overrides, ConfigError> {
    let u64_var = |key: &'static str| env_optional(key).map(|value| parse_u64(key, value)).transpose();

    Ok(Overrides {
        challenge_name: env_optional("CS_CHALLENGE_NAME"),
        grading_enabled: env_flag("CS_GRADING_ENABLED"),
        manual_grading: env_flag("CS_MANUAL_GRADING"),
        cron_grading: env_flag("CS_CRON_GRADING"),
        manual_script: env_optional("CS_MANUAL_GRADING_SCRIPT"),
        cron_script: env_optional("CS_CRON_GRADING_SCRIPT"),
        rate_limit: u64_var("CS_GRADING_RATE_LIMIT")?,
        token_location: env_optional("CS_TOKEN_LOCATION"),
        submission_method: env_optional("CS_SUBMISSION_METHOD"),
        grader_post: env_flag("CS_GRADER_POST"),
        grader_url: env_optional("CS_GRADER_URL"),
        grader_key: env_optional("CS_GRADER_KEY"),
        cron_interval: u64_var("CS_CRON_INTERVAL")?,
        cron_limit: env_optional("CS_CRON_LIMIT")
            .map(|value| parse_i64("CS_CRON_LIMIT", value))
            .transpose()?,
        cron_delay: u64_var("CS_CRON_DELAY")?,
        cron_at: env_optional("CS_CRON_AT"),
        port_checker: env_flag("CS_PORT_CHECKER"),
    })
}

#[cfg(test)]
impl Settings {
    /// Builds settings from a challenge file alone, with local defaults and no filesystem checks.
    /// Tokens always come from files under `<root>/tokens`.
    pub(crate) fn for_tests(raw_toml: &str, root: &Path) -> Self {
        use super::types::{Environment, TokenLocation};

        let mut resolved = ChallengeFile::from_toml(raw_toml)
            .and_then(|file| file.resolve(&Overrides::default()))
            .expect("challenge config");
        resolved.grading.token_location = TokenLocation::File;

        Self {
            server: ServerSettings {
                host: ServerHost("127.0.0.1".to_string()),
                port: ServerPort(8888),
            },
            runtime: RuntimeSettings { environment: Environment::Test, strict_config: false },
            challenge: ChallengeSettings {
                id: "test-challenge".to_string(),
                name: resolved.name.unwrap_or_else(|| "Test Challenge".to_string()),
                support_code: "test-cha".to_string(),
            },
            paths: PathSettings {
                custom_script_dir: root.join("custom_scripts"),
                token_dir: root.join("tokens"),
                upload_dir: root.join("uploads"),
                script_interpreter: "python3".to_string(),
                script_timeout: Some(Duration::from_secs(5)),
            },
            store: StoreSettings { backend: StoreBackend::Memory },
            database: DatabaseSettings {
                postgres_server: "localhost".to_string(),
                postgres_port: 5432,
                postgres_user: "challenge".to_string(),
                postgres_password: String::new(),
                postgres_db: "challenge_db".to_string(),
                database_url: None,
            },
            redis: RedisSettings {
                host: "localhost".to_string(),
                port: 6379,
                db: 0,
                password: String::new(),
                key_prefix: "guestinfo.".to_string(),
            },
            grading: resolved.grading,
            services: resolved.services,
            startup: resolved.startup,
            telemetry: TelemetrySettings {
                log_level: "debug".to_string(),
                json: false,
                prometheus_enabled: false,
            },
        }
    }
}
