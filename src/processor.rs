//! The downstream proxy-model update, seen from the dispatcher.
//!
//! The dispatcher knows nothing about what processing means; it only needs a
//! yes/no answer and whether a failure is worth retrying. [`Processor`] is that
//! seam. [`CommandProcessor`] runs an operator-supplied executable.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// EX_DATAERR: the command rejected the payload itself.
const EXIT_DATA_ERROR: i32 = 65;

/// A failed processing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProcessingError {
    pub message: String,
    /// False when another attempt cannot succeed (bad payload, missing binary).
    pub retryable: bool,
}

impl ProcessingError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Opaque processing capability invoked once per attempt.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, payload: &serde_json::Value) -> Result<(), ProcessingError>;
}

/// Runs an executable with the payload JSON on stdin.
///
/// Exit 0 is success, exit 65 is a permanent failure, anything else is
/// retryable. The child is killed if the attempt is cancelled by a timeout.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    command: PathBuf,
    args: Vec<String>,
}

impl CommandProcessor {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn command(&self) -> &Path {
        &self.command
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn process(&self, payload: &serde_json::Value) -> Result<(), ProcessingError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| ProcessingError::permanent(format!("serialize payload: {e}")))?;

        debug!(command = %self.command.display(), "running processor");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProcessingError::permanent(format!(
                    "cannot start {}: {e}",
                    self.command.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&body).await {
                // The command exited without reading; its status decides.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(ProcessingError::retryable(format!("write payload: {e}"))),
                Ok(()) => {}
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProcessingError::retryable(format!("wait for processor: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = format!("processor exited with status {code}: {}", stderr.trim());
        if code == EXIT_DATA_ERROR {
            Err(ProcessingError::permanent(message))
        } else {
            Err(ProcessingError::retryable(message))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> CommandProcessor {
        CommandProcessor::new("/bin/sh").args(["-c", script])
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        sh("cat > /dev/null").process(&json!({"object": "A"})).await.unwrap();
    }

    #[tokio::test]
    async fn payload_arrives_on_stdin() {
        let p = sh(r#"grep -q '"object":"A"' || exit 65"#);
        p.process(&json!({"object": "A", "rev": 1})).await.unwrap();
        let err = p.process(&json!({"object": "B", "rev": 1})).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn nonzero_exit_is_retryable_with_stderr() {
        let err = sh("echo model offline >&2; exit 3")
            .process(&json!({}))
            .await
            .unwrap_err();
        assert!(err.retryable);
        assert!(err.message.contains("model offline"), "{}", err.message);
    }

    #[tokio::test]
    async fn missing_binary_is_permanent() {
        let err = CommandProcessor::new("/nonexistent/proxymod-model")
            .process(&json!({}))
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }
}
