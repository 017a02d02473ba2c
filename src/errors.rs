//! Error types for the spinwire pipeline
//!
//! One root error with a sub-enum per concern, so callers can match on the
//! failure class (persistence vs. messaging vs. bad input) without string parsing.

use thiserror::Error;

/// Root error type for all spinwire operations
#[derive(Debug, Error)]
pub enum SpinwireError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Result store / analytics storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Message broker errors (connect, declare, publish, consume)
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Envelope encoding/decoding errors
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Game request errors
    #[error("Game error: {0}")]
    Game(#[from] GameError),
}

/// Configuration and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Storage system errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

/// Message broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Declare failed: {0}")]
    DeclareFailed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Consume failed: {0}")]
    ConsumeFailed(String),

    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),
}

/// Envelope and payload errors
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown event type for routing key '{0}'")]
    UnknownEventType(String),

    #[error("Payload does not match event type {expected}: {reason}")]
    PayloadMismatch { expected: String, reason: String },

    #[error("Inconsistent game result: {0}")]
    InconsistentResult(String),
}

/// Game request errors
#[derive(Debug, Error)]
pub enum GameError {
    #[error("Invalid bet amount: {0}")]
    InvalidBet(f64),

    #[error("Missing user id")]
    MissingUser,

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl SpinwireError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// Broker failures are infrastructure hiccups; everything else is a
    /// property of the input or the local environment.
    pub fn is_transient(&self) -> bool {
        matches!(self, SpinwireError::Broker(_))
    }
}

// External error conversions
impl From<rocksdb::Error> for SpinwireError {
    fn from(e: rocksdb::Error) -> Self {
        SpinwireError::Storage(StorageError::WriteFailed(e.to_string()))
    }
}

impl From<std::io::Error> for SpinwireError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                SpinwireError::Storage(StorageError::PermissionDenied(e.to_string()))
            }
            _ => SpinwireError::Storage(StorageError::ReadFailed(e.to_string())),
        }
    }
}

impl From<serde_json::Error> for SpinwireError {
    fn from(e: serde_json::Error) -> Self {
        SpinwireError::Message(MessageError::Malformed(e.to_string()))
    }
}

impl From<toml::de::Error> for SpinwireError {
    fn from(e: toml::de::Error) -> Self {
        SpinwireError::Configuration(ConfigurationError::LoadFailed(e.to_string()))
    }
}

impl From<toml::ser::Error> for SpinwireError {
    fn from(e: toml::ser::Error) -> Self {
        SpinwireError::Configuration(ConfigurationError::SaveFailed(e.to_string()))
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                BrokerError::ChannelClosed
            }
            other => BrokerError::ConnectionFailed(other.to_string()),
        }
    }
}

impl From<lapin::Error> for SpinwireError {
    fn from(e: lapin::Error) -> Self {
        SpinwireError::Broker(e.into())
    }
}

/// Convenience type alias for Results
pub type SpinwireResult<T> = Result<T, SpinwireError>;

/// Result type for the broker seam
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn test_error_display() {
        let config_error = ConfigurationError::ValidationFailed("prefetch".to_string());
        let error = SpinwireError::Configuration(config_error);

        assert!(error.to_string().contains("Configuration error"));
        assert!(error.to_string().contains("prefetch"));
    }

    #[test]
    fn test_invalid_value_details() {
        let error = ConfigurationError::InvalidValue {
            field: "broker.prefetch".to_string(),
            value: "0".to_string(),
            reason: "must be > 0".to_string(),
        };

        assert!(error.to_string().contains("broker.prefetch"));
        assert!(error.to_string().contains("must be > 0"));
    }

    #[test]
    fn test_error_conversion() {
        let error: SpinwireError = BrokerError::ChannelClosed.into();
        match error {
            SpinwireError::Broker(BrokerError::ChannelClosed) => {}
            _ => panic!("Expected broker error"),
        }
    }

    #[test]
    fn test_error_source() {
        let error = SpinwireError::Game(GameError::InvalidBet(-1.0));
        assert!(error.source().is_some());
    }

    #[test]
    fn test_transient_classification() {
        assert!(SpinwireError::from(BrokerError::ChannelClosed).is_transient());
        assert!(!SpinwireError::from(GameError::MissingUser).is_transient());
        assert!(!SpinwireError::from(MessageError::Malformed("x".into())).is_transient());
    }

    #[test]
    fn test_json_error_maps_to_malformed() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: SpinwireError = json_err.into();
        assert!(matches!(error, SpinwireError::Message(MessageError::Malformed(_))));
    }
}
