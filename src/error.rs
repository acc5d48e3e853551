use thiserror::Error;

/// Errors surfaced by the queue backend, the registry, and the worker loop.
///
/// Backend errors propagate out of `Push` and out of the blocking pop;
/// everything else is recorded on the job record and drives the retry state
/// machine instead of aborting the worker (see `crate::worker`).
#[derive(Debug, Error)]
pub enum Error {
    #[error("queue backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("redis error")]
    RedisError(#[from] redis::RedisError),

    #[error("no job type registered under the name {0:?}")]
    UnknownJob(String),

    #[error("a job type was registered twice under the name {0:?}")]
    DuplicateRegistration(String),

    #[error("malformed job payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),

    #[error("job handler failed: {0}")]
    JobFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
