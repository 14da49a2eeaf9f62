use thiserror::Error;

/// Result type for DCC-EX client operations
pub type Result<T> = std::result::Result<T, DccError>;

/// Errors that can occur when talking to a DCC-EX command station
#[derive(Error, Debug)]
pub enum DccError {
    /// I/O error on the station transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection attempt did not complete in time
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// A command was issued while no session is connected
    #[error("Not connected")]
    NotConnected,

    /// Locomotive address outside 1..=10239
    #[error("Invalid address {0}: must be between 1 and 10239")]
    InvalidAddress(i64),

    /// CV number outside 1..=1024
    #[error("Invalid CV number {0}: must be between 1 and 1024")]
    InvalidCv(i64),

    /// CV value outside 0..=255
    #[error("Invalid CV value {0}: must be between 0 and 255")]
    InvalidCvValue(i64),

    /// The service browser could not be started
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The event channel was closed
    #[error("Channel closed")]
    ChannelClosed,

    /// A subscriber fell behind and missed events
    #[error("Lagged by {0} events")]
    Lagged(u64),

    /// Configuration could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl DccError {
    /// Whether this error is a caller-input validation failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DccError::InvalidAddress(_) | DccError::InvalidCv(_) | DccError::InvalidCvValue(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connect_timeout_names_the_bound() {
        let err = DccError::ConnectTimeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "Connect timed out after 10s");
        assert!(!err.is_validation());
    }

    #[test]
    fn range_errors_are_validation_failures() {
        assert!(DccError::InvalidAddress(0).is_validation());
        assert!(DccError::InvalidCvValue(256).is_validation());
        assert!(!DccError::NotConnected.is_validation());
    }
}
