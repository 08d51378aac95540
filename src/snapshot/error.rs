use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("snapshot engine: {0}")]
    Engine(String),
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to exec df: `{command}` exited with {code:?}:\n{output}")]
    ProbeFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("disk usage probe cancelled")]
    Cancelled,
    #[error("invalid df output, {reason}:\n{output}")]
    DfOutput { reason: String, output: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Error::PreconditionFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
