use thiserror::Error;

pub type Result<T> = std::result::Result<T, AdbError>;

/// Everything that can go wrong between us and a device.
#[derive(Debug, Error)]
pub enum AdbError {
    #[error("invalid device address: {0}")]
    InvalidHost(String),

    #[error("connection closed by device")]
    ConnectionClosed,

    #[error("timed out connecting to device")]
    ConnectionTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device rejected both the signature and the public key.
    #[error("device refused authentication")]
    AuthenticationFailed,

    #[error("stream closed by device")]
    StreamClosed,

    #[error("sync transfer failed: {0}")]
    SyncFailed(String),

    #[error("unexpected response from device")]
    InvalidResponse,

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
