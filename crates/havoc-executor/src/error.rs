use havoc_core::chaos::SpecError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid fault request: {message}")]
    InvalidRequest { message: String },
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("executor spawn failed: {message}")]
    Spawn { message: String },
    #[error("executor timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
    #[error("executor rejected {op} on {target}: {message}")]
    Rejected {
        op: &'static str,
        target: String,
        message: String,
    },
    #[error("executor protocol error: {message}")]
    Protocol { message: String },
}
