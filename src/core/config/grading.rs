use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use validator::Validate;

use super::parsing::{
    parse_cron_at, parse_cron_limit, parse_submission_method, parse_token_location,
};
use super::types::{
    ConfigError, CronSettings, GradingPart, GradingParts, GradingSettings, PartKind, PhasePlan,
    ServiceCheck, ServiceDescriptor, StartupSettings, SubmissionMethod, SubmissionSettings,
};

/// Phase that is always scheduled last, wherever it sorts.
pub(crate) const TERMINAL_PHASE: &str = "mini_challenge";

const DEFAULT_CRON_INTERVAL_SECS: u64 = 60;
const DEFAULT_WEB_PORT: u16 = 80;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct ChallengeFile {
    challenge_name: Option<String>,
    port_checker: bool,
    grading: GradingSection,
    required_services: Vec<ServiceEntry>,
    startup: StartupSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GradingSection {
    enabled: bool,
    manual_grading: bool,
    manual_grading_script: Option<String>,
    cron_grading: bool,
    cron_grading_script: Option<String>,
    cron_interval: Option<u64>,
    cron_limit: Option<i64>,
    cron_delay: Option<u64>,
    cron_at: Option<String>,
    rate_limit: Option<u64>,
    token_location: Option<String>,
    grader_post: bool,
    submission: SubmissionSection,
    phases: bool,
    phase_info: BTreeMap<String, Vec<String>>,
    parts: BTreeMap<String, PartEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubmissionSection {
    method: Option<String>,
    grader_url: Option<String>,
    grader_key: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
struct PartEntry {
    #[validate(length(min = 1, message = "text must not be empty"))]
    text: String,
    #[validate(length(min = 1, message = "token_name must not be empty"))]
    token_name: String,
    #[serde(flatten)]
    kind: PartKind,
}

#[derive(Debug, Deserialize, Validate)]
struct ServiceEntry {
    name: Option<String>,
    #[validate(length(min = 1, message = "host must not be empty"))]
    host: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[validate(range(min = 1, message = "port must be non-zero"))]
    port: Option<u16>,
    path: Option<String>,
    #[serde(default)]
    block_startup_scripts: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartupSection {
    scripts: Vec<String>,
}

/// Environment values that win over the challenge file.
#[derive(Debug, Default, Clone)]
pub(super) struct Overrides {
    pub(super) challenge_name: Option<String>,
    pub(super) grading_enabled: Option<bool>,
    pub(super) manual_grading: Option<bool>,
    pub(super) cron_grading: Option<bool>,
    pub(super) manual_script: Option<String>,
    pub(super) cron_script: Option<String>,
    pub(super) rate_limit: Option<u64>,
    pub(super) token_location: Option<String>,
    pub(super) submission_method: Option<String>,
    pub(super) grader_post: Option<bool>,
    pub(super) grader_url: Option<String>,
    pub(super) grader_key: Option<String>,
    pub(super) cron_interval: Option<u64>,
    pub(super) cron_limit: Option<i64>,
    pub(super) cron_delay: Option<u64>,
    pub(super) cron_at: Option<String>,
    pub(super) port_checker: Option<bool>,
}

pub(super) struct ResolvedChallenge {
    pub(super) name: Option<String>,
    pub(super) grading: GradingSettings,
    pub(super) services: Vec<ServiceDescriptor>,
    pub(super) startup: StartupSettings,
}

impl ChallengeFile {
    pub(super) fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub(super) fn resolve(self, overrides: &Overrides) -> Result<ResolvedChallenge, ConfigError> {
        let grading = resolve_grading(self.grading, overrides)?;
        let services = self
            .required_services
            .into_iter()
            .map(resolve_service)
            .collect::<Result<Vec<_>, _>>()?;
        let startup = StartupSettings {
            scripts: self.startup.scripts,
            port_checker: overrides.port_checker.unwrap_or(self.port_checker),
        };

        Ok(ResolvedChallenge {
            name: overrides.challenge_name.clone().or(self.challenge_name),
            grading,
            services,
            startup,
        })
    }
}

/// Case-insensitive order with [`TERMINAL_PHASE`] moved to the end.
pub(crate) fn phase_order<'a>(labels: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let mut order: Vec<String> = labels.into_iter().cloned().collect();
    order.sort_by_key(|label| label.to_lowercase());
    if let Some(position) = order.iter().position(|label| label == TERMINAL_PHASE) {
        let terminal = order.remove(position);
        order.push(terminal);
    }
    order
}

fn resolve_grading(
    section: GradingSection,
    overrides: &Overrides,
) -> Result<GradingSettings, ConfigError> {
    let enabled = overrides.grading_enabled.unwrap_or(section.enabled);

    let mut parts = BTreeMap::new();
    for (label, entry) in section.parts {
        entry.validate()?;
        parts.insert(
            label.clone(),
            GradingPart { label, text: entry.text, token_name: entry.token_name, kind: entry.kind },
        );
    }
    let parts = GradingParts(parts);

    let manual_on = overrides.manual_grading.unwrap_or(section.manual_grading);
    let cron_on = overrides.cron_grading.unwrap_or(section.cron_grading);

    if enabled {
        if parts.is_empty() {
            return Err(ConfigError::Invalid(
                "grading is enabled but no grading parts are defined".to_string(),
            ));
        }
        if !manual_on && !cron_on {
            return Err(ConfigError::Invalid(
                "grading is enabled but neither manual_grading nor cron_grading is on".to_string(),
            ));
        }
    }

    let manual_script = if enabled && manual_on {
        let script = overrides
            .manual_script
            .clone()
            .or(section.manual_grading_script)
            .ok_or_else(|| {
                ConfigError::Invalid("manual grading is on but no manual_grading_script".to_string())
            })?;
        Some(script)
    } else {
        None
    };

    let cron = if enabled && cron_on {
        let script =
            overrides.cron_script.clone().or(section.cron_grading_script).ok_or_else(|| {
                ConfigError::Invalid("cron grading is on but no cron_grading_script".to_string())
            })?;
        let interval = overrides
            .cron_interval
            .or(section.cron_interval)
            .unwrap_or(DEFAULT_CRON_INTERVAL_SECS);
        let limit = parse_cron_limit(overrides.cron_limit.or(section.cron_limit).unwrap_or(-1));
        let delay = overrides.cron_delay.or(section.cron_delay).unwrap_or(0);
        let at = overrides
            .cron_at
            .clone()
            .or(section.cron_at)
            .map(|value| parse_cron_at(&value))
            .transpose()?;

        Some(CronSettings {
            script,
            interval: Duration::from_secs(interval),
            limit,
            delay: Duration::from_secs(delay),
            at,
        })
    } else {
        None
    };

    let rate_limit =
        Duration::from_secs(overrides.rate_limit.or(section.rate_limit).unwrap_or(0));

    let token_location = parse_token_location(
        overrides.token_location.as_deref().or(section.token_location.as_deref()).unwrap_or("env"),
    )?;

    let method = match overrides.submission_method.as_deref().or(section.submission.method.as_deref())
    {
        Some(value) => parse_submission_method(value)?,
        None if overrides.grader_post.unwrap_or(section.grader_post) => SubmissionMethod::GraderPost,
        None => SubmissionMethod::Display,
    };
    let grader_url =
        overrides.grader_url.clone().or(section.submission.grader_url).unwrap_or_default();
    let grader_key =
        overrides.grader_key.clone().or(section.submission.grader_key).unwrap_or_default();
    if enabled && method == SubmissionMethod::GraderPost {
        if grader_url.is_empty() {
            return Err(ConfigError::MissingSecret("grader_url"));
        }
        if grader_key.is_empty() {
            return Err(ConfigError::MissingSecret("grader_key"));
        }
    }

    let phases = if enabled && section.phases {
        Some(resolve_phases(section.phase_info, &parts)?)
    } else {
        None
    };

    Ok(GradingSettings {
        enabled,
        parts,
        manual_script,
        cron,
        rate_limit,
        phases,
        token_location,
        submission: SubmissionSettings { method, grader_url, grader_key },
    })
}

fn resolve_phases(
    phase_info: BTreeMap<String, Vec<String>>,
    parts: &GradingParts,
) -> Result<PhasePlan, ConfigError> {
    if phase_info.is_empty() {
        return Err(ConfigError::Invalid(
            "phases are enabled but phase_info is empty".to_string(),
        ));
    }

    for (phase, members) in &phase_info {
        if members.is_empty() {
            return Err(ConfigError::Invalid(format!("phase {phase} has no questions")));
        }
        if let Some(unknown) = members.iter().find(|label| !parts.contains(label)) {
            return Err(ConfigError::Invalid(format!(
                "phase {phase} references unknown grading part {unknown}"
            )));
        }
    }

    Ok(PhasePlan { order: phase_order(phase_info.keys()), members: phase_info })
}

fn resolve_service(entry: ServiceEntry) -> Result<ServiceDescriptor, ConfigError> {
    entry.validate()?;

    let kind = match entry.kind.as_deref() {
        Some(kind) => kind.to_ascii_lowercase(),
        None => {
            tracing::info!(host = %entry.host, "Service type missing; defaulting to ping");
            "ping".to_string()
        }
    };

    let check = match kind.as_str() {
        "ping" => ServiceCheck::Ping,
        "socket" => {
            let port = entry.port.ok_or_else(|| {
                ConfigError::Invalid(format!("socket service {} requires a port", entry.host))
            })?;
            ServiceCheck::Socket { port }
        }
        "web" => {
            let path = entry.path.unwrap_or_else(|| "/".to_string());
            let path = if path.starts_with('/') { path } else { format!("/{path}") };
            ServiceCheck::Web { port: entry.port.unwrap_or(DEFAULT_WEB_PORT), path }
        }
        other => {
            return Err(ConfigError::Invalid(format!(
                "service {} has unknown type {other}; expected ping, socket or web",
                entry.host
            )))
        }
    };

    let name = entry.name.unwrap_or_else(|| match &check {
        ServiceCheck::Ping => entry.host.clone(),
        ServiceCheck::Socket { port } => format!("{}:{port}", entry.host),
        ServiceCheck::Web { port, path } => format!("{}:{port}{path}", entry.host),
    });

    Ok(ServiceDescriptor { name, host: entry.host, check, blocking: entry.block_startup_scripts })
}

#[cfg(test)]
impl GradingSettings {
    pub(crate) fn from_toml_str(raw: &str) -> Self {
        ChallengeFile::from_toml(raw)
            .and_then(|file| file.resolve(&Overrides::default()))
            .expect("challenge config")
            .grading
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TokenLocation;

    fn resolve(raw: &str) -> Result<ResolvedChallenge, ConfigError> {
        ChallengeFile::from_toml(raw)?.resolve(&Overrides::default())
    }

    const BASE: &str = r#"
        challenge_name = "Demo"

        [grading]
        enabled = true
        manual_grading = true
        manual_grading_script = "grade.py"
        rate_limit = 30

        [grading.parts.GradingCheck1]
        mode = "text"
        text = "What is the flag?"
        token_name = "token1"

        [grading.parts.GradingCheck2]
        mode = "mc"
        text = "Pick one"
        token_name = "token2"
        opts = { a = "Alpha", b = "Beta" }

        [grading.parts.GradingCheck3]
        mode = "upload"
        text = "Upload the capture"
        token_name = "token3"
        upload_key = "pcap"
    "#;

    #[test]
    fn phase_order_moves_terminal_phase_last() {
        let labels =
            vec!["zz".to_string(), "mini_challenge".to_string(), "aa".to_string()];
        assert_eq!(phase_order(&labels), vec!["aa", "zz", "mini_challenge"]);
    }

    #[test]
    fn phase_order_sorts_case_insensitively() {
        let labels = vec!["phase_B".to_string(), "Phase_a".to_string(), "phase_c".to_string()];
        assert_eq!(phase_order(&labels), vec!["Phase_a", "phase_B", "phase_c"]);
    }

    #[test]
    fn parts_deserialize_into_tagged_modes() {
        let resolved = resolve(BASE).expect("resolve");
        let parts = &resolved.grading.parts;
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.get("GradingCheck1").unwrap().kind, PartKind::Text);
        match &parts.get("GradingCheck2").unwrap().kind {
            PartKind::MultipleChoice { opts } => assert_eq!(opts.get("a").unwrap(), "Alpha"),
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(
            parts.get("GradingCheck3").unwrap().kind,
            PartKind::Upload { upload_key: "pcap".to_string() }
        );
        assert_eq!(resolved.grading.rate_limit, Duration::from_secs(30));
        assert_eq!(resolved.grading.token_location, TokenLocation::Env);
        assert_eq!(resolved.name.as_deref(), Some("Demo"));
    }

    #[test]
    fn multiple_choice_without_opts_is_rejected() {
        let raw = r#"
            [grading]
            enabled = true
            manual_grading = true
            manual_grading_script = "grade.py"
            [grading.parts.Q1]
            mode = "mc"
            text = "Pick"
            token_name = "t"
        "#;
        assert!(matches!(resolve(raw), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let raw = r#"
            [grading]
            enabled = true
            manual_grading = true
            manual_grading_script = "grade.py"
            [grading.parts.Q1]
            mode = "essay"
            text = "Write"
            token_name = "t"
        "#;
        assert!(matches!(resolve(raw), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn empty_token_name_fails_validation() {
        let raw = r#"
            [grading]
            enabled = true
            manual_grading = true
            manual_grading_script = "grade.py"
            [grading.parts.Q1]
            mode = "button"
            text = "Press"
            token_name = ""
        "#;
        assert!(matches!(resolve(raw), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn enabled_grading_needs_a_lane() {
        let raw = r#"
            [grading]
            enabled = true
            [grading.parts.Q1]
            mode = "button"
            text = "Press"
            token_name = "t"
        "#;
        assert!(matches!(resolve(raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn grader_post_requires_url_and_key() {
        let raw = format!("{BASE}\n[grading.submission]\nmethod = \"grader_post\"\n");
        assert!(matches!(resolve(&raw), Err(ConfigError::MissingSecret("grader_url"))));
    }

    #[test]
    fn phases_must_reference_known_parts() {
        let raw = BASE.replace(
            "rate_limit = 30",
            "rate_limit = 30\nphases = true\nphase_info = { one = [\"GradingCheck1\", \"Nope\"] }",
        );
        assert!(matches!(resolve(&raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn phase_plan_tracks_terminal_phase() {
        let raw = BASE.replace(
            "rate_limit = 30",
            "rate_limit = 30\nphases = true\nphase_info = { mini_challenge = [\"GradingCheck3\"], alpha = [\"GradingCheck1\", \"GradingCheck2\"] }",
        );
        let plan = resolve(&raw).expect("resolve").grading.phases.expect("phases");
        assert_eq!(plan.order(), ["alpha".to_string(), "mini_challenge".to_string()]);
        assert!(plan.is_terminal("mini_challenge"));
        assert!(!plan.is_terminal("alpha"));
        assert_eq!(plan.members("alpha").len(), 2);
    }

    #[test]
    fn cron_settings_apply_defaults_and_overrides() {
        let raw = BASE.replace(
            "manual_grading = true",
            "manual_grading = true\ncron_grading = true\ncron_grading_script = \"cron.sh\"\ncron_at = \"06:30\"",
        );
        let file = ChallengeFile::from_toml(&raw).expect("parse");
        let overrides = Overrides { cron_limit: Some(5), ..Overrides::default() };
        let cron = file.resolve(&overrides).expect("resolve").grading.cron.expect("cron");
        assert_eq!(cron.interval, Duration::from_secs(60));
        assert_eq!(cron.limit, Some(5));
        assert_eq!(cron.at.map(|at| (at.hour, at.minute)), Some((6, 30)));
    }

    #[test]
    fn services_default_type_port_and_path() {
        let raw = r#"
            [[required_services]]
            host = "10.5.5.5"

            [[required_services]]
            host = "web.local"
            type = "web"
            block_startup_scripts = true

            [[required_services]]
            name = "ssh"
            host = "fd00::1"
            type = "socket"
            port = 22
        "#;
        let services = resolve(raw).expect("resolve").services;
        assert_eq!(services[0].check, ServiceCheck::Ping);
        assert_eq!(services[0].name, "10.5.5.5");
        assert_eq!(services[1].check, ServiceCheck::Web { port: 80, path: "/".to_string() });
        assert!(services[1].blocking);
        assert_eq!(services[2].check, ServiceCheck::Socket { port: 22 });
        assert_eq!(services[2].name, "ssh");
    }

    #[test]
    fn socket_service_requires_port() {
        let raw = r#"
            [[required_services]]
            host = "10.5.5.5"
            type = "socket"
        "#;
        assert!(matches!(resolve(raw), Err(ConfigError::Invalid(_))));
    }
}
