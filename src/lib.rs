pub mod error;
pub mod types;
pub mod utils;
pub mod tracker {
    pub mod http;
    pub mod memory;
    pub mod udp;
}

pub mod probe {
    pub mod announce;
    pub mod result;
    pub mod session;
    pub mod validation;
}

#[cfg(test)]
mod testing;

use std::time::Duration;

pub use error::TrackerError;
pub use probe::result::{Capabilities, Capability, HttpResult, Outcome, ProbeError, Test, TrackerResult};
pub use probe::session::{run_all, run_http_session, test_http_tracker, test_udp_tracker};
pub use types::{AnnounceRequest, AnnounceResponse, Announcer, Event, InfoHash, Peer, PeerId, Response};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15); // per-read deadline
pub const NUMWANT: i32 = 50;
pub const UDP_PROTOCOL_ID: u64 = 0x41727101980; // BEP 15 connect magic
pub const PEER_ID_PREFIX: &[u8] = b"-PK0100-"; // Azureus-style client tag
