//! Error types shared by the scheduling engine

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("work store error: {0}")]
    Store(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("payload decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("leadership lost for key {0}")]
    LeadershipLost(String),
    #[error("batch failed: {0}")]
    BatchFailed(String),
    #[error("coalescer is closed")]
    CoalescerClosed,
    #[error("invalid judge: {0}")]
    InvalidJudge(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Returns true when the error only signals that the caller's context ended.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

/// Result alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_distinguishable() {
        assert!(EngineError::Cancelled.is_cancelled());
        assert!(!EngineError::Store("down".to_string()).is_cancelled());
        assert!(!EngineError::LeadershipLost("k".to_string()).is_cancelled());
    }
}
