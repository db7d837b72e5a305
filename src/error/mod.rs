//! Error types and handling for the BitChat mesh core
//!
//! Every fallible operation in the crate returns [`Result`]. Variants are
//! grouped by failure domain so callers can route retries and monitoring
//! without string-matching messages.

use thiserror::Error;

/// Result type alias for BitChat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Radio and transport layer errors
    Network,
    /// Cryptographic and security errors
    Security,
    /// Wire format and input validation errors
    Validation,
    /// Configuration and setup errors
    Configuration,
    /// Resource exhaustion errors
    Resources,
    /// Internal system errors
    Internal,
    /// Platform-specific errors
    Platform,
}

impl ErrorCategory {
    /// Get the monitoring severity level for this category
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Security => ErrorSeverity::Critical,
            Self::Network | Self::Internal | Self::Platform => ErrorSeverity::High,
            Self::Resources => ErrorSeverity::Medium,
            Self::Validation | Self::Configuration => ErrorSeverity::Low,
        }
    }

    /// Get the recommended retry strategy for this category
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::Network => RetryStrategy::ExponentialBackoff { max_retries: 3 },
            Self::Resources => RetryStrategy::LinearBackoff { max_retries: 5 },
            Self::Validation | Self::Security | Self::Configuration => RetryStrategy::NoRetry,
            _ => RetryStrategy::LinearBackoff { max_retries: 1 },
        }
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Retry strategies for error recovery
#[derive(Debug, Clone, Copy)]
pub enum RetryStrategy {
    NoRetry,
    LinearBackoff { max_retries: u32 },
    ExponentialBackoff { max_retries: u32 },
}

/// BitChat mesh core error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Duplicate packet: {0}")]
    DuplicatePacket(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No established session with peer {0}")]
    NoSession(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),
}

impl Error {
    /// Get the error category for monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::Platform(_) => ErrorCategory::Platform,
            Self::Serialization(_) | Self::Deserialization(_) => ErrorCategory::Internal,
            Self::Crypto(_) | Self::InvalidSignature(_) | Self::Noise(_)
            | Self::DuplicatePacket(_) => ErrorCategory::Security,
            Self::Protocol(_) | Self::Network(_) | Self::Transport(_) | Self::UnknownPeer(_)
            | Self::NoSession(_) | Self::SessionNotFound | Self::Timeout(_) => {
                ErrorCategory::Network
            }
            Self::ResourceExhausted(_) | Self::RateLimitExceeded(_) => ErrorCategory::Resources,
            Self::Config(_) | Self::NotInitialized(_) => ErrorCategory::Configuration,
            Self::InvalidData(_) | Self::InvalidTimestamp(_) | Self::InvalidState(_) => {
                ErrorCategory::Validation
            }
        }
    }

    /// Get the error severity for alerting
    pub fn severity(&self) -> ErrorSeverity {
        self.category().severity()
    }

    /// Get the recommended retry strategy
    pub fn retry_strategy(&self) -> RetryStrategy {
        self.category().retry_strategy()
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.retry_strategy(), RetryStrategy::NoRetry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = Error::Network("scan failed".to_string());
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_severity() {
        let err = Error::InvalidSignature("bad identity announcement".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validation_no_retry() {
        let err = Error::InvalidTimestamp("outside replay window".to_string());
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(!err.is_retryable());
    }
}
