use thiserror::Error;

pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("transient storage error: {0}")]
    TransientStorage(String),
    #[error("ordering conflict: {0}")]
    OrderingConflict(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl PaymentError {
    /// Whether a job attempt that failed with this error should be retried.
    ///
    /// Errors caused by the bytes or the configuration cannot succeed on a
    /// second attempt, so they fail the job terminally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentError::TransientStorage(_)
                | PaymentError::IoError(_)
                | PaymentError::InternalError(_)
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        PaymentError::InternalError(Box::new(std::io::Error::other(message.into())))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for PaymentError {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            rocksdb::ErrorKind::Busy
            | rocksdb::ErrorKind::TryAgain
            | rocksdb::ErrorKind::TimedOut => PaymentError::TransientStorage(err.to_string()),
            _ => PaymentError::InternalError(Box::new(err)),
        }
    }
}
