use super::{LanguageModel, ModelError};
use crate::config::LlmConfig;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Language model behind an external command.
///
/// The prompt is written to the command's stdin; its stdout is the answer.
pub struct CommandModel {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    name: String,
}

impl CommandModel {
    pub fn new(command: &[String], timeout_secs: u64) -> Result<Self, ModelError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ModelError::Unavailable("empty model command".to_string()))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
            name: command.join(" "),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ModelError> {
        Self::new(&config.command, config.timeout_secs)
    }

    async fn run(&self, prompt: &str) -> Result<String, ModelError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ModelError::Unavailable(format!("{}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| ModelError::Unavailable(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ModelError::Unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let answer = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if answer.is_empty() {
            return Err(ModelError::InvalidResponse("empty output".to_string()));
        }
        Ok(answer)
    }
}

#[async_trait]
impl LanguageModel for CommandModel {
    async fn call(&self, prompt: &str) -> Result<String, ModelError> {
        timeout(self.timeout, self.run(prompt))
            .await
            .map_err(|_| ModelError::Timeout(self.timeout.as_secs()))?
    }

    fn name(&self) -> &str {
        &self.name
    }
}
