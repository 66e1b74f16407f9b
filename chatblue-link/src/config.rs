//! Runtime tunables for the supervisor and its sessions.

use std::time::Duration;

use chatblue_core::link::DEFAULT_MAX_ATTEMPTS;
use chatblue_core::{DEFAULT_SERVICE_UUID, MAX_FRAME_LEN};
use uuid::Uuid;

pub const DEFAULT_READ_BUFFER: usize = 4096;
pub const DEFAULT_WRITE_CHUNK: usize = 8192;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Identity used for discovery filtering and as the default server identity.
    pub service_uuid: Uuid,
    /// Settle time before each outbound attempt.
    pub pre_connect_delay: Duration,
    /// Wait after a busy failure before the role-flipped retry.
    pub retry_settle_delay: Duration,
    /// 1 disables the retry. Values above 2 are treated as 2.
    pub max_connect_attempts: u32,
    pub read_buffer_size: usize,
    pub write_chunk_size: usize,
    pub max_frame_len: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            pre_connect_delay: Duration::from_millis(600),
            retry_settle_delay: Duration::from_millis(1500),
            max_connect_attempts: DEFAULT_MAX_ATTEMPTS,
            read_buffer_size: DEFAULT_READ_BUFFER,
            write_chunk_size: DEFAULT_WRITE_CHUNK,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl LinkConfig {
    /// Delays shortened for tests and loopback use.
    pub fn immediate() -> Self {
        Self {
            pre_connect_delay: Duration::ZERO,
            retry_settle_delay: Duration::from_millis(20),
            ..Self::default()
        }
    }
}
