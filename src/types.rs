use crate::error::TrackerError;
use crate::NUMWANT;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

/// 20-byte swarm identifier.
///
/// Any other length is representable so that negative probes can send it; a
/// conformant tracker must reject those.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfoHash(#[serde(with = "serde_bytes")] Vec<u8>);

impl InfoHash {
    pub const LEN: usize = 20;

    pub fn new(bytes: [u8; 20]) -> InfoHash {
        InfoHash(bytes.to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> InfoHash {
        InfoHash(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.0.len() == Self::LEN
    }

    /// Fixed-size view, or `None` when the length is not 20.
    pub fn to_array(&self) -> Option<[u8; 20]> {
        self.0.as_slice().try_into().ok()
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash(")?;
        write_hex(f, &self.0)?;
        write!(f, ")")
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// A peer's client identifier, 20 bytes on the wire.
///
/// Empty when a response did not carry identities (compact and UDP peer lists).
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "serde_bytes")] Vec<u8>);

impl PeerId {
    pub const LEN: usize = 20;

    pub fn new(bytes: [u8; 20]) -> PeerId {
        PeerId(bytes.to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> PeerId {
        PeerId(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.0.len() == Self::LEN
    }

    pub fn to_array(&self) -> Option<[u8; 20]> {
        self.0.as_slice().try_into().ok()
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    pub(crate) fn push(&mut self, byte: u8) {
        self.0.push(byte);
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId(")?;
        write_hex(f, &self.0)?;
        write!(f, ")")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// A swarm member. Equality covers identity, address and port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    /// `0.0.0.0` in a request means "let the tracker use the source address"
    pub ip: IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn new(id: PeerId, ip: IpAddr, port: u16) -> Peer {
        Peer {
            id,
            ip: ip.to_canonical(),
            port,
        }
    }

    /// A peer that leaves address detection to the tracker.
    pub fn unaddressed(id: PeerId, port: u16) -> Peer {
        Peer::new(id, IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    /// Loose match of a returned peer against one we announced.
    ///
    /// The port always has to agree. The identity is compared only when the
    /// returned entry carries one, and the address only when `compare_ip` is
    /// set, since a tracker may legitimately substitute the source address.
    pub fn matches(&self, announced: &Peer, compare_ip: bool) -> bool {
        self.port == announced.port
            && (self.id.is_empty() || self.id == announced.id)
            && (!compare_ip || self.ip == announced.ip)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "{}", self.socket_addr())
        } else {
            write!(f, "{} ({})", self.socket_addr(), self.id)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    #[default]
    None,
    Started,
    Stopped,
    Completed,
    /// deliberately malformed, only sent by negative probes
    Invalid,
}

impl Event {
    /// Value of the HTTP `event` parameter; `None` omits the parameter.
    pub fn as_query_value(self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
            Event::Invalid => Some("invalid"),
        }
    }

    /// BEP 15 event code. `Invalid` maps to the first unassigned code.
    pub fn udp_code(self) -> u32 {
        match self {
            Event::None => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
            Event::Invalid => 4,
        }
    }

    pub fn from_udp_code(code: u32) -> Event {
        match code {
            0 => Event::None,
            1 => Event::Completed,
            2 => Event::Started,
            3 => Event::Stopped,
            _ => Event::Invalid,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer: Peer,
    /// signed so negative probes can send -1
    pub uploaded: i64,
    pub downloaded: i64,
    /// 0 for a seeder, anything else for a leecher
    pub left: i64,
    pub event: Event,
    pub numwant: i32,
    pub compact: bool,
}

impl AnnounceRequest {
    /// A compact `started` announce with nothing transferred and `left` at 0.
    pub fn new(info_hash: InfoHash, peer: Peer) -> AnnounceRequest {
        AnnounceRequest {
            info_hash,
            peer,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: Event::Started,
            numwant: NUMWANT,
            compact: true,
        }
    }

    pub fn is_seeder(&self) -> bool {
        self.left == 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub min_interval: Option<i64>,
    /// seeders
    pub complete: i64,
    /// leechers
    pub incomplete: i64,
    pub peers: Vec<Peer>,
}

/// Everything a tracker can answer to a well-formed exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Announce(AnnounceResponse),
    Error(String),
    Warning(String),
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Announce(r) => write!(
                f,
                "interval={} complete={} incomplete={} peers={}",
                r.interval,
                r.complete,
                r.incomplete,
                r.peers.len()
            ),
            Response::Error(msg) => write!(f, "error: {msg}"),
            Response::Warning(msg) => write!(f, "warning: {msg}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScrapeRequest {
    pub info_hashes: Vec<InfoHash>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scrape {
    pub complete: i64,
    pub downloaded: i64,
    pub incomplete: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub files: HashMap<InfoHash, Scrape>,
}

/// Anything that can carry an announce to a tracker and bring back its answer.
pub trait Announcer {
    fn announce(&mut self, req: &AnnounceRequest) -> Result<Response, TrackerError>;
}

impl<A: Announcer + ?Sized> Announcer for &mut A {
    fn announce(&mut self, req: &AnnounceRequest) -> Result<Response, TrackerError> {
        (**self).announce(req)
    }
}

impl<A: Announcer + ?Sized> Announcer for Box<A> {
    fn announce(&mut self, req: &AnnounceRequest) -> Result<Response, TrackerError> {
        (**self).announce(req)
    }
}

pub trait Scraper {
    fn scrape(&mut self, req: &ScrapeRequest) -> Result<ScrapeResponse, TrackerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn peer(port: u16) -> Peer {
        Peer::new(PeerId::new([7; 20]), "1.2.3.4".parse().unwrap(), port)
    }

    #[test]
    fn test_peer_equality() {
        assert_eq!(peer(8080), peer(8080));
        assert_ne!(peer(8080), peer(8081));

        let mut other = peer(8080);
        other.ip = "1.2.3.5".parse().unwrap();
        assert_ne!(peer(8080), other);

        let mut other = peer(8080);
        other.id = PeerId::new([8; 20]);
        assert_ne!(peer(8080), other);
    }

    #[test]
    fn test_peer_mapped_ipv4_is_canonical() {
        let mapped = IpAddr::V6(Ipv4Addr::new(1, 2, 3, 4).to_ipv6_mapped());
        let p = Peer::new(PeerId::new([7; 20]), mapped, 8080);
        assert_eq!(p, peer(8080));

        let v6 = Peer::new(PeerId::default(), IpAddr::V6(Ipv6Addr::LOCALHOST), 1);
        assert!(v6.ip.is_ipv6());
    }

    #[test]
    fn test_peer_matches() {
        let announced = peer(8080);
        let compact = Peer::new(PeerId::default(), "127.0.0.1".parse().unwrap(), 8080);
        assert!(compact.matches(&announced, false));
        assert!(!compact.matches(&announced, true));
        assert!(announced.clone().matches(&announced, true));

        let stranger = Peer::new(PeerId::new([9; 20]), announced.ip, 8080);
        assert!(!stranger.matches(&announced, false));
    }

    #[test]
    fn test_event_codes() {
        for event in [
            Event::None,
            Event::Started,
            Event::Stopped,
            Event::Completed,
            Event::Invalid,
        ] {
            assert_eq!(Event::from_udp_code(event.udp_code()), event);
        }
        assert_eq!(Event::None.as_query_value(), None);
        assert_eq!(Event::Invalid.as_query_value(), Some("invalid"));
    }

    #[test]
    fn test_identifier_lengths() {
        assert!(InfoHash::new([1; 20]).is_valid());
        assert!(!InfoHash::from_bytes(&[30, 30, 30]).is_valid());
        assert_eq!(InfoHash::from_bytes(&[30; 21]).to_array(), None);
        assert_eq!(InfoHash::new([0xab; 20]).to_string(), "ab".repeat(20));
    }
}
