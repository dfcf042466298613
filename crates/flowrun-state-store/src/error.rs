use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid key pattern: {0}")]
    InvalidPattern(#[from] glob::PatternError),
    #[error("{backend} store unavailable after {attempts} attempts: {message}")]
    Unavailable {
        backend: String,
        attempts: u32,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Redis(e) => !matches!(
                e.kind(),
                redis::ErrorKind::TypeError | redis::ErrorKind::InvalidClientConfig
            ),
            StoreError::Serialization(_) | StoreError::InvalidPattern(_) => false,
            StoreError::Unavailable { .. } => true,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            StoreError::Redis(_) => "redis",
            StoreError::Serialization(_) => "serialization",
            StoreError::InvalidPattern(_) => "pattern",
            StoreError::Unavailable { .. } => "unavailable",
        }
    }
}

impl From<StoreError> for flowrun_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(e) => flowrun_core::Error::Serialization(e.to_string()),
            StoreError::InvalidPattern(e) => flowrun_core::Error::validation(e.to_string()),
            StoreError::Redis(e) => flowrun_core::Error::external("Redis", e.to_string()),
            StoreError::Unavailable {
                backend, message, ..
            } => flowrun_core::Error::external(backend, message),
        }
    }
}
