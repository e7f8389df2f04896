use thiserror::Error;

/// Domain errors for the asset delivery service.
///
/// Paywall rejections deliberately surface as `NotFound` so that paywalled
/// and absent assets are indistinguishable to clients.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Asset, variation or download source does not exist (or the requester
    /// may not know whether it exists).
    #[error("not found")]
    NotFound,

    /// A stored invariant is broken, e.g. a video asset without its video
    /// row. Never masked by a fallback; must be surfaced and alerted on.
    #[error("data integrity fault: {0}")]
    DataIntegrity(String),

    /// The object storage backend failed while signing or checking a source.
    /// Retryable by the caller; not retried here.
    #[error("storage backend unavailable: {0}")]
    StorageUnavailable(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type Result<T, E = DeliveryError> = std::result::Result<T, E>;

impl DeliveryError {
    /// Short machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::NotFound => "NOT_FOUND",
            DeliveryError::DataIntegrity(_) => "INTEGRITY_ERROR",
            DeliveryError::StorageUnavailable(_) => "STORAGE_ERROR",
            DeliveryError::Database(_) => "DATABASE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DeliveryError::NotFound.code(), "NOT_FOUND");
        assert_eq!(
            DeliveryError::DataIntegrity("video 1 missing".to_string()).code(),
            "INTEGRITY_ERROR"
        );
        assert_eq!(
            DeliveryError::StorageUnavailable("timeout".to_string()).code(),
            "STORAGE_ERROR"
        );
    }
}
