//! `shell` step provider.
//!
//! Runs `params.command` through `sh -c` and captures its output. The child is
//! killed when the invocation future is dropped, so the dispatcher's per-attempt
//! timeout also terminates the process.
//!
//! Params:
//! - `command` (required): the shell command line
//! - `cwd`: working directory
//! - `stdin`: text written to the child's standard input
//! - `env`: object of extra environment variables (string values)

use std::process::Stdio;

use gantry_core::provider::{ProviderRequest, StepProvider};
use gantry_types::error::ProviderError;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Default)]
pub struct ShellProvider {
    shell: String,
}

impl ShellProvider {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl StepProvider for ShellProvider {
    fn name(&self) -> &str {
        "shell"
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        let command = request
            .param_str("command")
            .ok_or_else(|| ProviderError::permanent("shell step requires a 'command' string"))?;
        let shell = if self.shell.is_empty() { "sh" } else { &self.shell };

        let mut cmd = tokio::process::Command::new(shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = request.param_str("cwd") {
            cmd.current_dir(cwd);
        }
        if let Some(Value::Object(env)) = request.params.get("env") {
            for (key, value) in env {
                match value {
                    Value::String(s) => cmd.env(key, s),
                    other => cmd.env(key, other.to_string()),
                };
            }
        }

        tracing::debug!(run_id = %request.run_id, step_id = %request.stage, command, "spawning shell command");
        let mut child = cmd
            .spawn()
            .map_err(|e| ProviderError::permanent(format!("failed to spawn '{shell}': {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(input) = request.param_str("stdin") {
                // A child that exits without reading stdin closes the pipe early.
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!(step_id = %request.stage, error = %e, "stdin closed early");
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::permanent(format!("failed to wait for command: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();

        if !output.status.success() {
            let detail = stderr.trim();
            let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(ProviderError::permanent(if detail.is_empty() {
                format!("command exited with status {code}")
            } else {
                format!("command exited with status {code}: {detail}")
            }));
        }

        Ok(json!({
            "stdout": stdout.trim_end_matches('\n'),
            "stderr": stderr,
            "exit_code": exit_code,
        }))
    }
}
