//! Service identity and the discovery beacon advertised by LAN transports.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current beacon version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Service identity advertised by ChatBlue instances (SDP record / beacon).
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x3f4d0001_8b99_4fdd_a17b_9b0a4a97d0c7);

/// Parse a service identity; blank or malformed input falls back to the default.
pub fn service_identity_or_default(s: Option<&str>) -> Uuid {
    match s.map(str::trim) {
        Some(v) if !v.is_empty() => Uuid::parse_str(v).unwrap_or(DEFAULT_SERVICE_UUID),
        _ => DEFAULT_SERVICE_UUID,
    }
}

/// Presence advertisement. Encoding is bincode; one beacon per datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub protocol_version: u8,
    pub service: Uuid,
    /// Random per-process id so a host can skip its own beacons.
    pub instance: Uuid,
    pub display_name: Option<String>,
    pub listen_port: u16,
}

impl Beacon {
    pub fn new(service: Uuid, instance: Uuid, display_name: Option<String>, listen_port: u16) -> Self {
        Beacon {
            protocol_version: PROTOCOL_VERSION,
            service,
            instance,
            display_name,
            listen_port,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BeaconError> {
        bincode::serialize(self).map_err(BeaconError::Codec)
    }

    /// Decode a datagram. Beacons from other protocol versions are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, BeaconError> {
        let beacon: Beacon = bincode::deserialize(bytes).map_err(BeaconError::Codec)?;
        if beacon.protocol_version != PROTOCOL_VERSION {
            return Err(BeaconError::Version(beacon.protocol_version));
        }
        Ok(beacon)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    #[error("beacon codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unsupported beacon version {0}")]
    Version(u8),
}
