use crate::error::TrackerError;
use crate::types::{AnnounceRequest, AnnounceResponse, Announcer, Peer, PeerId, Response};
use crate::utils::{resolve, wait_ready};
use crate::{DEFAULT_TIMEOUT, UDP_PROTOCOL_ID};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_ERROR: u32 = 3;

pub const CONNECT_LEN: usize = 16;
pub const ANNOUNCE_LEN: usize = 98;
pub const ANNOUNCE_HEADER_LEN: usize = 20;
pub const COMPACT_PEER_LEN: usize = 6;

const RECV_BUFFER_LEN: usize = 4096;
const SOCKET: Token = Token(0);

/// Source of transaction IDs.
///
/// Clones share one counter, so clients built from clones of the same value
/// never reuse an ID against a tracker until the 32-bit counter wraps.
#[derive(Clone, Debug)]
pub struct TransactionIds(Arc<AtomicU32>);

impl TransactionIds {
    /// Starts at a random point.
    pub fn new() -> TransactionIds {
        TransactionIds::starting_at(rand::random())
    }

    pub fn starting_at(start: u32) -> TransactionIds {
        TransactionIds(Arc::new(AtomicU32::new(start)))
    }

    pub fn next(&self) -> u32 {
        // fetch_add wraps on overflow
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

impl Default for TransactionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// BEP 15 tracker client.
///
/// By default every announce is preceded by a fresh connect. With
/// auto-connect disabled the caller manages the connection ID through
/// [`UdpTracker::manual_connect`] or [`UdpTracker::set_connection_id`].
#[derive(Debug)]
pub struct UdpTracker {
    addr: SocketAddr,
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    timeout: Duration,
    transaction_ids: TransactionIds,
    connection_id: u64,
    auto_connect: bool,
}

impl UdpTracker {
    /// `addr` is `host:port` or a `udp://host:port/...` URL.
    pub fn new(addr: &str) -> Result<Self, TrackerError> {
        Self::with_transaction_ids(addr, TransactionIds::new())
    }

    pub fn with_transaction_ids(
        addr: &str,
        transaction_ids: TransactionIds,
    ) -> Result<Self, TrackerError> {
        let addr = resolve(&host_port(addr)?)?;
        let local: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let mut socket = UdpSocket::bind(local).map_err(TrackerError::io("bind"))?;
        socket.connect(addr).map_err(TrackerError::io("connect"))?;
        let poll = Poll::new().map_err(TrackerError::io("poll"))?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE)
            .map_err(TrackerError::io("poll"))?;
        log::debug!("UDP tracker client for {addr} bound to {:?}", socket.local_addr());
        Ok(Self {
            addr,
            socket,
            poll,
            events: Events::with_capacity(8),
            timeout: DEFAULT_TIMEOUT,
            transaction_ids,
            connection_id: 0,
            auto_connect: true,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Deadline for every single read.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_auto_connect(&mut self, auto_connect: bool) {
        self.auto_connect = auto_connect;
    }

    /// Only used while auto-connect is disabled.
    pub fn set_connection_id(&mut self, connection_id: u64) {
        self.connection_id = connection_id;
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Performs a connect exchange, stores and returns the new connection ID.
    pub fn manual_connect(&mut self) -> Result<u64, TrackerError> {
        let transaction_id = self.transaction_ids.next();
        let packet = encode_connect(transaction_id).map_err(TrackerError::io("connect"))?;
        log::trace!("connect: sending transaction {transaction_id} to {}", self.addr);
        self.send("connect", &packet)?;

        let mut buf = [0u8; RECV_BUFFER_LEN];
        let len = self.recv("connect", &mut buf)?;
        let connection_id = decode_connect(&buf[..len], transaction_id)?;
        log::trace!("connect: got connection ID {connection_id:#x}");
        self.connection_id = connection_id;
        Ok(connection_id)
    }

    fn send(&mut self, phase: &'static str, packet: &[u8]) -> Result<(), TrackerError> {
        self.discard_stale();
        let sent = self.socket.send(packet).map_err(TrackerError::io(phase))?;
        if sent != packet.len() {
            return Err(TrackerError::malformed(
                phase,
                format!("sent {sent} of {} bytes", packet.len()),
            ));
        }
        Ok(())
    }

    // a reply that arrives after its request timed out must not be taken
    // for the answer to the next request
    fn discard_stale(&mut self) {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        while let Ok(len) = self.socket.recv(&mut buf) {
            log::debug!("discarding stale {len}-byte datagram from {}", self.addr);
        }
    }

    fn recv(&mut self, phase: &'static str, buf: &mut [u8]) -> Result<usize, TrackerError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.socket.recv(buf) {
                Ok(len) => return Ok(len),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    wait_ready(&mut self.poll, &mut self.events, deadline, phase, self.timeout)?
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TrackerError::Io { phase, source: e }),
            }
        }
    }
}

impl Announcer for UdpTracker {
    fn announce(&mut self, req: &AnnounceRequest) -> Result<Response, TrackerError> {
        log::debug!("announcing to {}: {req:?}", self.addr);
        // fail before touching the network if the request cannot be framed
        let ids = fixed_ids(req)?;

        if self.auto_connect {
            self.manual_connect()?;
        }

        let transaction_id = self.transaction_ids.next();
        let packet = encode_announce(req, ids, self.connection_id, transaction_id)
            .map_err(TrackerError::io("announce"))?;
        self.send("announce", &packet)?;

        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        let len = self.recv("announce", &mut buf)?;
        let response = decode_announce(&buf[..len], transaction_id)?;
        log::debug!("got announce response from {}: {response}", self.addr);
        Ok(response)
    }
}

fn host_port(addr: &str) -> Result<String, TrackerError> {
    if !addr.contains("://") {
        return Ok(addr.to_string());
    }
    let url = Url::parse(addr)?;
    if url.scheme() != "udp" {
        return Err(TrackerError::UnsupportedScheme(url.scheme().to_string()));
    }
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => Ok(format!("{host}:{port}")),
        _ => Err(TrackerError::Resolve {
            addr: addr.to_string(),
            source: None,
        }),
    }
}

fn fixed_ids(req: &AnnounceRequest) -> Result<([u8; 20], [u8; 20]), TrackerError> {
    let info_hash = req.info_hash.to_array().ok_or_else(|| {
        TrackerError::Unencodable(format!(
            "UDP announces carry a 20-byte info_hash, got {} bytes",
            req.info_hash.len()
        ))
    })?;
    let peer_id = req.peer.id.to_array().ok_or_else(|| {
        TrackerError::Unencodable(format!(
            "UDP announces carry a 20-byte peer_id, got {} bytes",
            req.peer.id.len()
        ))
    })?;
    Ok((info_hash, peer_id))
}

pub fn encode_connect(transaction_id: u32) -> io::Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(CONNECT_LEN);
    packet.write_u64::<BigEndian>(UDP_PROTOCOL_ID)?;
    packet.write_u32::<BigEndian>(ACTION_CONNECT)?;
    packet.write_u32::<BigEndian>(transaction_id)?;
    Ok(packet)
}

/// Returns the connection ID carried by a connect reply.
pub fn decode_connect(packet: &[u8], transaction_id: u32) -> Result<u64, TrackerError> {
    if packet.len() < 8 {
        return Err(TrackerError::malformed(
            "connect",
            format!("did not receive 16 bytes (got {})", packet.len()),
        ));
    }
    let action = BigEndian::read_u32(&packet[0..4]);
    let received = BigEndian::read_u32(&packet[4..8]);
    if received != transaction_id {
        return Err(TrackerError::TransactionMismatch {
            phase: "connect",
            sent: transaction_id,
            received,
        });
    }
    match action {
        ACTION_CONNECT if packet.len() == CONNECT_LEN => Ok(BigEndian::read_u64(&packet[8..16])),
        ACTION_CONNECT => Err(TrackerError::malformed(
            "connect",
            format!("did not receive 16 bytes (got {})", packet.len()),
        )),
        ACTION_ERROR => Err(TrackerError::ConnectRejected(
            String::from_utf8_lossy(&packet[8..]).into_owned(),
        )),
        action => Err(TrackerError::UnexpectedAction {
            phase: "connect",
            action,
        }),
    }
}

pub fn encode_announce(
    req: &AnnounceRequest,
    (info_hash, peer_id): ([u8; 20], [u8; 20]),
    connection_id: u64,
    transaction_id: u32,
) -> io::Result<Vec<u8>> {
    // IPv6 overrides do not fit the 4-byte field; leave detection to the tracker
    let ip = match req.peer.ip {
        IpAddr::V4(ip) => u32::from(ip),
        IpAddr::V6(_) => 0,
    };

    let mut packet = Vec::with_capacity(ANNOUNCE_LEN);
    packet.write_u64::<BigEndian>(connection_id)?;
    packet.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    packet.write_u32::<BigEndian>(transaction_id)?;
    packet.extend_from_slice(&info_hash);
    packet.extend_from_slice(&peer_id);
    packet.write_i64::<BigEndian>(req.downloaded)?;
    packet.write_i64::<BigEndian>(req.left)?;
    packet.write_i64::<BigEndian>(req.uploaded)?;
    packet.write_u32::<BigEndian>(req.event.udp_code())?;
    packet.write_u32::<BigEndian>(ip)?;
    packet.write_u32::<BigEndian>(0)?; // key
    packet.write_i32::<BigEndian>(req.numwant)?;
    packet.write_u16::<BigEndian>(req.peer.port)?;
    Ok(packet)
}

pub fn decode_announce(packet: &[u8], transaction_id: u32) -> Result<Response, TrackerError> {
    if packet.len() < 8 {
        return Err(TrackerError::malformed(
            "announce",
            format!("did not receive at least 8 bytes (got {})", packet.len()),
        ));
    }
    let action = BigEndian::read_u32(&packet[0..4]);
    let received = BigEndian::read_u32(&packet[4..8]);
    if received != transaction_id {
        return Err(TrackerError::TransactionMismatch {
            phase: "announce",
            sent: transaction_id,
            received,
        });
    }

    match action {
        ACTION_ANNOUNCE => {}
        ACTION_ERROR => {
            let message = String::from_utf8_lossy(&packet[8..]).into_owned();
            return Ok(Response::Error(message));
        }
        action => {
            return Err(TrackerError::UnexpectedAction {
                phase: "announce",
                action,
            })
        }
    }

    if packet.len() < ANNOUNCE_HEADER_LEN
        || (packet.len() - ANNOUNCE_HEADER_LEN) % COMPACT_PEER_LEN != 0
    {
        return Err(TrackerError::malformed(
            "announce",
            format!("unexpected announce response length: {}", packet.len()),
        ));
    }

    let peers = packet[ANNOUNCE_HEADER_LEN..]
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|record| {
            let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
            let port = BigEndian::read_u16(&record[4..6]);
            Peer::new(PeerId::default(), IpAddr::V4(ip), port)
        })
        .collect();

    Ok(Response::Announce(AnnounceResponse {
        interval: i64::from(BigEndian::read_u32(&packet[8..12])),
        min_interval: None,
        incomplete: i64::from(BigEndian::read_u32(&packet[12..16])),
        complete: i64::from(BigEndian::read_u32(&packet[16..20])),
        peers,
    }))
}
