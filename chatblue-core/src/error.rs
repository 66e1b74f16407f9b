//! Error taxonomy shared by the core and the runtime.

use std::io;

use crate::frame::{FrameDecodeError, FrameEncodeError};

/// Every failure the link layer reports upward.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Adapter or service absent or disabled.
    #[error("radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Busy or transient; the supervisor may retry with a flipped role.
    #[error("connect failed (retryable): {0}")]
    ConnectRetryable(String),

    #[error("connect failed: {0}")]
    ConnectFatal(String),

    #[error("invalid device address: {0:?}")]
    InvalidAddress(String),

    #[error("protocol decode error: {0}")]
    ProtocolDecode(#[from] FrameDecodeError),

    #[error("payload of {0} bytes exceeds frame limit")]
    FrameTooLarge(usize),

    #[error("not connected")]
    NotConnected,

    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl LinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::ConnectRetryable(_))
    }
}

impl From<FrameEncodeError> for LinkError {
    fn from(e: FrameEncodeError) -> Self {
        match e {
            FrameEncodeError::TooLarge(n) => LinkError::FrameTooLarge(n),
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
