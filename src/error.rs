//! Error types for IndriyaIO

use crate::core::types::SensorId;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// IndriyaIO error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parse error
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration serialize error
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Configuration is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Backend process unreachable after bounded retries
    #[error("Backend unreachable after {0} attempts")]
    ConnectFailed(u32),

    /// Operation attempted before the backend was connected
    #[error("Backend not connected")]
    NotConnected,

    /// Unknown sensor id
    #[error("Unknown sensor: {0}")]
    InvalidSensor(SensorId),

    /// samplingPeriod x fifo count exceeds the representable range
    #[error("Sampling parameters overflow for sensor {0}")]
    Overflow(SensorId),

    /// Socketpair allocation failed
    #[error("Socket create failed: {0}")]
    SocketCreateFailed(std::io::Error),

    /// Non-blocking send could not complete (full buffer or closed peer)
    #[error("Send failed on client channel")]
    SendFailed,

    /// Channel descriptors have been closed
    #[error("Channel is closed")]
    ChannelClosed,

    /// Backend rejected a configuration request
    #[error("Backend rejected configuration: {0}")]
    ConfigureFailed(String),

    /// Open channel cap reached
    #[error("Client channel limit reached ({0})")]
    TooManyClients(usize),

    /// Malformed frame on the backend connection
    #[error("Backend protocol error: {0}")]
    Protocol(String),

    /// Backend did not answer a command in time
    #[error("Communication timeout")]
    Timeout,

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
