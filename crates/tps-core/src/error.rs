use thiserror::Error;

pub type TpsResult<T> = Result<T, TpsError>;

#[derive(Debug, Error)]
pub enum TpsError {
    #[error("connection pool not configured: {0}")]
    PoolNotFound(String),
    #[error("backend unreachable for pool {pool} after {attempts} attempts")]
    BackendUnreachable { pool: String, attempts: u32 },
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
    #[error("backend rejected request with status {status}")]
    BackendRejected { status: i64 },
    #[error("key operation failed: {0}")]
    KeyOperationFailed(String),
    #[error("audit sink write failed: {0}")]
    SinkWriteFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TpsError {
    pub fn crypto<E: std::fmt::Display>(err: E) -> Self {
        Self::KeyOperationFailed(err.to_string())
    }
    pub fn sink<E: std::fmt::Display>(err: E) -> Self {
        Self::SinkWriteFailed(err.to_string())
    }
    pub fn transport<E: std::fmt::Display>(err: E) -> Self {
        Self::Transport(err.to_string())
    }
    pub fn config<E: std::fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }
    pub fn malformed<E: std::fmt::Display>(err: E) -> Self {
        Self::MalformedResponse(err.to_string())
    }
    pub fn invalid<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidRequest(err.to_string())
    }

    /// Transport failures are recovered by failover; everything else ends the transaction.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
