//! Worker Protocol over a child process's stdin/stdout/stderr.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{RecurseError, RecurseResult};

use super::{Worker, WorkerRequest};

/// Spawns `program` once per request, feeds the JSON request on stdin and
/// reads the reply from stdout.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    timeout_secs: u64,
}

impl ProcessWorker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout_secs: 300,
        }
    }

    pub fn with_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    async fn run(&self, payload: String) -> RecurseResult<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| RecurseError::SandboxCall {
            sandbox: None,
            message: format!("failed to spawn {}: {e}", self.program.display()),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into());
            return Err(RecurseError::SandboxCall {
                sandbox: None,
                message: format!("worker exited with {code}: {}", stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn call(&self, request: &WorkerRequest) -> RecurseResult<String> {
        let payload = request.to_json()?;
        tokio::time::timeout(Duration::from_secs(self.timeout_secs), self.run(payload))
            .await
            .map_err(|_| RecurseError::Timeout {
                operation: format!("worker call ({})", self.program.display()),
                secs: self.timeout_secs,
            })?
    }
}
