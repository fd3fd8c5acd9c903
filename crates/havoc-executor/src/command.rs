//! Executor that forwards each call to an external program.
//!
//! The program receives one JSON [`ExecutorRequest`] on stdin and must print
//! one JSON [`ExecutorResponse`] on stdout before exiting.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use havoc_core::types::Target;

use crate::adapter::FaultExecutor;
use crate::error::ExecutorError;
use crate::types::{
    ApplyOutcome, ExecutorRequest, ExecutorResponse, Fault, FaultTag, RecoverOutcome,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExecutor {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn call(
        &self,
        op: &'static str,
        target: &Target,
        request: &ExecutorRequest,
    ) -> Result<ExecutorResponse, ExecutorError> {
        if self.timeout.is_zero() {
            return Err(ExecutorError::InvalidRequest {
                message: "timeout must be greater than zero".to_string(),
            });
        }
        let body = serde_json::to_vec(request).map_err(|err| ExecutorError::Protocol {
            message: err.to_string(),
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ExecutorError::Spawn {
                message: format!("{}: {err}", self.program),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&body)
                .await
                .map_err(|err| ExecutorError::Spawn {
                    message: format!("failed to write request: {err}"),
                })?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecutorError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(|err| ExecutorError::Spawn {
                message: err.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(op, target_id = %target, status = ?output.status.code(), "executor exited with failure");
            return Err(ExecutorError::Rejected {
                op,
                target: target.id(),
                message: if stderr.is_empty() {
                    format!("exit status {:?}", output.status.code())
                } else {
                    stderr
                },
            });
        }

        let response: ExecutorResponse =
            serde_json::from_slice(&output.stdout).map_err(|err| ExecutorError::Protocol {
                message: format!("invalid response from {}: {err}", self.program),
            })?;
        if !response.ok {
            return Err(ExecutorError::Rejected {
                op,
                target: target.id(),
                message: response.message,
            });
        }
        debug!(op, target_id = %target, already = response.already, "executor call finished");
        Ok(response)
    }
}

#[async_trait]
impl FaultExecutor for CommandExecutor {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn apply(&self, target: &Target, fault: &Fault) -> Result<ApplyOutcome, ExecutorError> {
        let request = ExecutorRequest::Apply {
            target: target.clone(),
            fault: fault.clone(),
        };
        let response = self.call("apply", target, &request).await?;
        Ok(if response.already {
            ApplyOutcome::AlreadyApplied
        } else {
            ApplyOutcome::Applied
        })
    }

    async fn recover(
        &self,
        target: &Target,
        tag: FaultTag,
    ) -> Result<RecoverOutcome, ExecutorError> {
        let request = ExecutorRequest::Recover {
            target: target.clone(),
            tag,
        };
        let response = self.call("recover", target, &request).await?;
        Ok(if response.already {
            RecoverOutcome::NothingToRecover
        } else {
            RecoverOutcome::Recovered
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::types::StressRequest;
    use havoc_core::types::ObjectKey;

    fn target() -> Target {
        Target::Pod(ObjectKey::new("default", "web-0"))
    }

    fn stress() -> Fault {
        Fault::Stress {
            request: StressRequest {
                stressors: "--cpu 1".to_string(),
            },
        }
    }

    fn shell(script: &str) -> CommandExecutor {
        CommandExecutor::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn successful_response_maps_to_outcome() {
        let executor = shell(r#"cat >/dev/null; echo '{"ok":true,"already":true}'"#);
        let outcome = executor.apply(&target(), &stress()).await.expect("apply");
        assert_eq!(outcome, ApplyOutcome::AlreadyApplied);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_rejection_with_stderr() {
        let executor = shell("cat >/dev/null; echo 'no such pod' >&2; exit 3");
        let err = executor
            .recover(&target(), FaultTag::Stress)
            .await
            .unwrap_err();
        match err {
            ExecutorError::Rejected { op, message, .. } => {
                assert_eq!(op, "recover");
                assert_eq!(message, "no such pod");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn garbage_output_is_a_protocol_error() {
        let executor = shell("cat >/dev/null; echo nope");
        let err = executor.apply(&target(), &stress()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Protocol { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let executor = CommandExecutor::new(
            "/nonexistent/havoc-executor",
            Vec::new(),
            Duration::from_secs(1),
        );
        let err = executor.apply(&target(), &stress()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }
}
