//! Upward events streamed to the host shell.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::discovery::PeerRecord;
use crate::frame::FrameKind;

/// Transfer direction for progress updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local `disconnect()` or shutdown.
    Manual,
    /// Remote closed the stream.
    Eof,
    /// Read-side I/O failure.
    Io(String),
    /// A newer session took its place.
    Replaced,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Manual => f.write_str("manual"),
            DisconnectReason::Eof => f.write_str("eof"),
            DisconnectReason::Io(msg) => write!(f, "io: {msg}"),
            DisconnectReason::Replaced => f.write_str("replaced"),
        }
    }
}

impl Serialize for DisconnectReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Remote end of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub address: Option<String>,
    pub display_name: Option<String>,
    /// True when this side hosts the endpoint (accepted), false when it dialed.
    pub owner: bool,
}

/// Every event the core reports. Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    ScanStarted,
    PeerFound {
        peer: PeerRecord,
    },
    ScanFinished,
    ScanError {
        message: String,
    },
    Connected {
        remote: PeerDescriptor,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    MessageReceived {
        kind: FrameKind,
        bytes: Vec<u8>,
        text: Option<String>,
    },
    Progress {
        direction: Direction,
        current: u32,
        total: u32,
        kind: FrameKind,
    },
    SocketError {
        message: String,
    },
}

impl Event {
    pub fn scan_error(err: impl fmt::Display) -> Self {
        Event::ScanError {
            message: err.to_string(),
        }
    }

    pub fn socket_error(err: impl fmt::Display) -> Self {
        Event::SocketError {
            message: err.to_string(),
        }
    }

    pub fn progress(direction: Direction, current: u32, total: u32, kind: FrameKind) -> Self {
        Event::Progress {
            direction,
            current,
            total,
            kind,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Event::ScanError { .. } | Event::SocketError { .. })
    }
}
