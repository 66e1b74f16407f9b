//! ChatBlue link core.
//! Host-driven: no I/O; the runtime passes bytes and signals in and receives events back.

pub mod discovery;
pub mod error;
pub mod event;
pub mod frame;
pub mod link;
pub mod protocol;

pub use discovery::{Confirmation, DiscoveryTracker, PeerRecord, ScanSignal};
pub use error::LinkError;
pub use event::{Direction, DisconnectReason, Event, PeerDescriptor};
pub use frame::{
    encode_frame, encode_header, try_decode_next, Frame, FrameDecodeError, FrameDecoder,
    FrameEncodeError, FrameKind, HEADER_LEN, MAX_FRAME_LEN,
};
pub use link::{ConnectionState, LinkState, OpenPath, RetryDecision, RoleIntent, SessionId};
pub use protocol::{service_identity_or_default, Beacon, DEFAULT_SERVICE_UUID, PROTOCOL_VERSION};
