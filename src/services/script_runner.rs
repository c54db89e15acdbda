use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::core::config::PathSettings;

/// Raw result of one script invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScriptOutput {
    pub(crate) exit_code: Option<i32>,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) elapsed: Duration,
}

impl ScriptOutput {
    pub(crate) fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub(crate) enum ScriptError {
    #[error("failed to launch {script}: {source}")]
    Spawn {
        script: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{script} timed out after {seconds}s")]
    Timeout { script: String, seconds: u64 },
    #[error("{script} exited with status {code:?}; stderr: {stderr}")]
    Failed { script: String, code: Option<i32>, stderr: String },
    #[error("{script} finished without output")]
    EmptyOutput { script: String },
}

/// Runs grading and startup scripts by name.
#[async_trait]
pub(crate) trait ScriptRunner: Send + Sync {
    async fn invoke(&self, script: &str, args: &[String]) -> Result<ScriptOutput, ScriptError>;
}

/// Invokes a script and treats a non-zero exit or empty stdout as failure.
pub(crate) async fn run_checked(
    runner: &dyn ScriptRunner,
    script: &str,
    args: &[String],
) -> Result<ScriptOutput, ScriptError> {
    let output = runner.invoke(script, args).await?;
    if !output.succeeded() {
        return Err(ScriptError::Failed {
            script: script.to_string(),
            code: output.exit_code,
            stderr: output.stderr,
        });
    }
    if output.stdout.trim().is_empty() {
        return Err(ScriptError::EmptyOutput { script: script.to_string() });
    }
    Ok(output)
}

pub(crate) struct ProcessScriptRunner {
    script_dir: PathBuf,
    interpreter: String,
    timeout: Option<Duration>,
}

impl ProcessScriptRunner {
    pub(crate) fn new(paths: &PathSettings) -> Self {
        Self {
            script_dir: paths.custom_script_dir.clone(),
            interpreter: paths.script_interpreter.clone(),
            timeout: paths.script_timeout,
        }
    }

    fn command(&self, script: &str, args: &[String]) -> Command {
        let path = self.script_dir.join(script);
        let mut command = if path.extension().is_some_and(|ext| ext == "py") {
            let mut command = Command::new(&self.interpreter);
            command.arg(&path);
            command
        } else {
            Command::new(&path)
        };
        command
            .args(args)
            .current_dir(&self.script_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn invoke(&self, script: &str, args: &[String]) -> Result<ScriptOutput, ScriptError> {
        tracing::debug!(script, args = ?args, "Running script");
        let started = Instant::now();
        let spawn_error =
            |source: std::io::Error| ScriptError::Spawn { script: script.to_string(), source };

        let child = self.command(script, args).spawn().map_err(spawn_error)?;
        let waited = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, waited).await.map_err(|_| {
                tracing::error!(script, seconds = limit.as_secs(), "Script timed out; killing it");
                ScriptError::Timeout { script: script.to_string(), seconds: limit.as_secs() }
            })?,
            None => waited.await,
        }
        .map_err(spawn_error)?;

        let result = ScriptOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            script,
            exit_code = ?result.exit_code,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Script finished"
        );
        Ok(result)
    }
}
