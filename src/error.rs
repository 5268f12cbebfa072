use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a single control frame could not be decoded.
///
/// The reader that produced it is still usable: the offending bytes have
/// already been consumed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing frame magic, skipped {skipped} bytes")]
    BadMagic { skipped: usize },
    #[error("unsupported frame version {0}")]
    BadVersion(u8),
    #[error("unknown command {0:#04x}")]
    UnknownCommand(u8),
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    BadChecksum { expected: u8, actual: u8 },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control frame decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("control connection closed")]
    ControlClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("socks5: {0}")]
    Socks(String),
}

impl Error {
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    pub fn socks(msg: impl Into<String>) -> Self {
        Error::Socks(msg.into())
    }

    /// Errors scoped to a single frame or connection. The surrounding loop
    /// logs them and keeps going.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::Timeout(_) | Error::Socks(_))
    }
}
