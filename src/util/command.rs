use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CronvaultError, Result};

/// A fully described external command. Values are already resolved; secrets
/// travel through `env` or `stdin`, never through `args`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            return self.program.clone();
        }
        format!("{} {}", self.program, self.args.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands on the host; the child is killed when the timeout elapses.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput> {
        debug!(command = %spec.display(), "exec");
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| CronvaultError::message(format!("{}: {}", spec.program, e)))?;
        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|e| CronvaultError::message(format!("{} stdin: {}", spec.program, e)))?;
            }
        }
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| CronvaultError::Timeout {
                operation: spec.program.clone(),
                seconds: timeout.as_secs(),
            })?
            .map_err(|e| CronvaultError::message(format!("{}: {}", spec.program, e)))?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Records every command and replies with queued outputs (success when
    /// the queue is empty).
    #[derive(Default)]
    pub struct RecordingRunner {
        pub calls: Mutex<Vec<(CommandSpec, Duration)>>,
        replies: Mutex<VecDeque<CommandOutput>>,
        delay: Mutex<Option<Duration>>,
    }

    impl RecordingRunner {
        pub fn reply(&self, code: i32, stderr: &str) {
            self.replies.lock().unwrap().push_back(CommandOutput {
                code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            });
        }

        /// Makes every later command take `delay` before it replies.
        pub fn hang(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn programs(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(spec, _)| spec.program.clone())
                .collect()
        }

        pub fn call(&self, index: usize) -> (CommandSpec, Duration) {
            self.calls.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push((spec.clone(), timeout));
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
        }
    }
}
