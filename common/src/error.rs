use thiserror::Error;

use crate::types::ErrorClass;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("WiFi is not connected.")]
    NotConnected,
    #[error("{0}")]
    Failed(String),
}

impl NetworkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotConnected => ErrorClass::Connectivity,
            Self::Failed(_) => ErrorClass::Generic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("measurement command not acknowledged ({written} of 2 bytes written)")]
    WriteFailed { written: usize },
    #[error("short read from sensor ({len} bytes)")]
    ShortRead { len: usize },
    #[error("CRC checksum failed (computed {expected:#04x}, received {actual:#04x})")]
    Checksum { expected: u8, actual: u8 },
    #[error("sensor bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayFailure {
    #[error("relay answered HTTP {0}")]
    HttpStatus(u16),
    #[error("relay transport error: {0}")]
    Transport(String),
    #[error("relay request timed out")]
    Timeout,
    #[error("network link is down")]
    LinkDown,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimitError {
    #[error("limit `{0}` is not a number")]
    NotANumber(String),
    #[error("limit {0} is outside the accepted range")]
    OutOfRange(f32),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config store I/O failed: {0}")]
    Io(String),
    #[error("config store contents are invalid: {0}")]
    Encoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_reads_like_the_board_message() {
        assert_eq!(
            format!("Error: {}", NetworkError::NotConnected),
            "Error: WiFi is not connected."
        );
    }

    #[test]
    fn only_not_connected_is_a_connectivity_class() {
        assert_eq!(NetworkError::NotConnected.class(), ErrorClass::Connectivity);
        assert_eq!(
            NetworkError::Failed("bind failed".into()).class(),
            ErrorClass::Generic
        );
    }
}
