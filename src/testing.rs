//! Tracker doubles shared by the unit tests.

use crate::error::TrackerError;
use crate::tracker::memory::MemoryTracker;
use crate::tracker::udp::{ACTION_ANNOUNCE, ACTION_CONNECT, ACTION_ERROR};
use crate::types::{
    AnnounceRequest, AnnounceResponse, Announcer, Event, InfoHash, Peer, PeerId, Response,
};
use byteorder::{BigEndian, ByteOrder};
use serde_bencode::value::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn timeout() -> TrackerError {
    TrackerError::Timeout {
        phase: "announce",
        timeout: Duration::from_secs(1),
    }
}

/// Answers announces from a fixed queue and remembers what it was asked.
/// Once the queue runs dry every announce times out.
#[derive(Debug, Default)]
pub struct ScriptedTracker {
    responses: VecDeque<Result<Response, TrackerError>>,
    requests: Vec<AnnounceRequest>,
}

impl ScriptedTracker {
    pub fn new(responses: Vec<Result<Response, TrackerError>>) -> Self {
        ScriptedTracker {
            responses: responses.into(),
            requests: Vec::new(),
        }
    }

    /// A successful answer listing `peers`.
    pub fn peers(peers: Vec<Peer>) -> Result<Response, TrackerError> {
        Ok(Response::Announce(AnnounceResponse {
            interval: 1800,
            peers,
            ..Default::default()
        }))
    }

    pub fn requests(&self) -> &[AnnounceRequest] {
        &self.requests
    }
}

impl Announcer for ScriptedTracker {
    fn announce(&mut self, req: &AnnounceRequest) -> Result<Response, TrackerError> {
        self.requests.push(req.clone());
        self.responses.pop_front().unwrap_or_else(|| Err(timeout()))
    }
}

/// Passes announces through, except that the calls with the given
/// zero-based indices time out.
#[derive(Debug)]
pub struct Faulty<A> {
    inner: A,
    failing: HashSet<usize>,
    calls: usize,
}

impl<A: Announcer> Faulty<A> {
    pub fn new(inner: A, failing: impl IntoIterator<Item = usize>) -> Self {
        Faulty {
            inner,
            failing: failing.into_iter().collect(),
            calls: 0,
        }
    }
}

impl<A: Announcer> Announcer for Faulty<A> {
    fn announce(&mut self, req: &AnnounceRequest) -> Result<Response, TrackerError> {
        let call = self.calls;
        self.calls += 1;
        if self.failing.contains(&call) {
            return Err(timeout());
        }
        self.inner.announce(req)
    }
}

/// Serves datagrams on a loopback socket from a background thread. The
/// handler's return value, if any, is sent back to the sender.
pub fn spawn_udp_responder<F>(mut handler: F) -> SocketAddr
where
    F: FnMut(&[u8], SocketAddr) -> Option<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((len, from)) = socket.recv_from(&mut buf) {
            if let Some(reply) = handler(&buf[..len], from) {
                let _ = socket.send_to(&reply, from);
            }
        }
    });
    addr
}

/// Puts `tracker` behind a BEP 15 socket.
pub fn serve_memory_udp(tracker: MemoryTracker) -> SocketAddr {
    const CONNECTION_ID: u64 = 0x5eed_5eed;
    spawn_udp_responder(move |packet, from| {
        if packet.len() < 16 {
            return None;
        }
        let transaction_id = &packet[12..16];
        let mut reply = Vec::new();

        if packet.len() == 16 && BigEndian::read_u64(&packet[0..8]) == crate::UDP_PROTOCOL_ID {
            reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
            reply.extend_from_slice(transaction_id);
            reply.extend_from_slice(&CONNECTION_ID.to_be_bytes());
            return Some(reply);
        }
        if packet.len() != 98 || BigEndian::read_u32(&packet[8..12]) != ACTION_ANNOUNCE {
            return None;
        }

        let ip = Ipv4Addr::from(BigEndian::read_u32(&packet[84..88]));
        let peer = Peer::new(
            PeerId::from_bytes(&packet[36..56]),
            IpAddr::V4(ip),
            BigEndian::read_u16(&packet[96..98]),
        );
        let mut req = AnnounceRequest::new(InfoHash::from_bytes(&packet[16..36]), peer);
        req.downloaded = BigEndian::read_i64(&packet[56..64]);
        req.left = BigEndian::read_i64(&packet[64..72]);
        req.uploaded = BigEndian::read_i64(&packet[72..80]);
        req.event = Event::from_udp_code(BigEndian::read_u32(&packet[80..84]));
        req.numwant = BigEndian::read_i32(&packet[92..96]);

        match tracker.announce_from(&req, from.ip()) {
            Response::Announce(resp) => {
                reply.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
                reply.extend_from_slice(transaction_id);
                reply.extend_from_slice(&(resp.interval as u32).to_be_bytes());
                reply.extend_from_slice(&(resp.incomplete as u32).to_be_bytes());
                reply.extend_from_slice(&(resp.complete as u32).to_be_bytes());
                for peer in resp.peers {
                    if let IpAddr::V4(ip) = peer.ip {
                        reply.extend_from_slice(&ip.octets());
                        reply.extend_from_slice(&peer.port.to_be_bytes());
                    }
                }
            }
            Response::Error(msg) | Response::Warning(msg) => {
                reply.extend_from_slice(&ACTION_ERROR.to_be_bytes());
                reply.extend_from_slice(transaction_id);
                reply.extend_from_slice(msg.as_bytes());
            }
        }
        Some(reply)
    })
}

/// Accepts HTTP connections on loopback and answers each request head with
/// whatever `handler` returns. Every request head is also sent down the
/// returned channel.
pub fn spawn_http_responder<F>(mut handler: F) -> (SocketAddr, mpsc::Receiver<String>)
where
    F: FnMut(&str) -> Vec<u8> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => raw.extend_from_slice(&buf[..n]),
                }
            }
            let head = String::from_utf8_lossy(&raw).into_owned();
            let response = handler(&head);
            let _ = tx.send(head);
            let _ = stream.write_all(&response);
        }
    });
    (addr, rx)
}

fn bytes(b: impl Into<Vec<u8>>) -> Value {
    Value::Bytes(b.into())
}

fn query_request(head: &str) -> AnnounceRequest {
    let target = head.split_whitespace().nth(1).unwrap_or_default();
    let query = target.split_once('?').map(|(_, q)| q).unwrap_or_default();

    let mut params: HashMap<&str, Vec<u8>> = HashMap::new();
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(key, urlencoding::decode_binary(value.as_bytes()).into_owned());
    }
    let text = |key: &str| params.get(key).map(|v| String::from_utf8_lossy(v).into_owned());
    let number = |key: &str| text(key).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);

    let ip = text("ip")
        .and_then(|ip| ip.parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let peer = Peer::new(
        PeerId::from_bytes(params.get("peer_id").map(Vec::as_slice).unwrap_or_default()),
        ip,
        number("port") as u16,
    );
    let mut req = AnnounceRequest::new(
        InfoHash::from_bytes(params.get("info_hash").map(Vec::as_slice).unwrap_or_default()),
        peer,
    );
    req.uploaded = number("uploaded");
    req.downloaded = number("downloaded");
    req.left = number("left");
    req.numwant = number("numwant") as i32;
    req.compact = text("compact").as_deref() == Some("1");
    req.event = match text("event").as_deref() {
        None => Event::None,
        Some("started") => Event::Started,
        Some("stopped") => Event::Stopped,
        Some("completed") => Event::Completed,
        Some(_) => Event::Invalid,
    };
    req
}

/// Puts `tracker` behind an HTTP announce endpoint.
pub fn serve_memory_http(tracker: MemoryTracker) -> SocketAddr {
    let (addr, _heads) = spawn_http_responder(move |head| {
        let req = query_request(head);
        let mut dict = HashMap::new();
        match tracker.announce_from(&req, IpAddr::V4(Ipv4Addr::LOCALHOST)) {
            Response::Announce(resp) => {
                dict.insert(b"interval".to_vec(), Value::Int(resp.interval));
                dict.insert(b"complete".to_vec(), Value::Int(resp.complete));
                dict.insert(b"incomplete".to_vec(), Value::Int(resp.incomplete));
                let peers = if req.compact {
                    let mut compact = Vec::new();
                    for peer in &resp.peers {
                        if let IpAddr::V4(ip) = peer.ip {
                            compact.extend_from_slice(&ip.octets());
                            compact.extend_from_slice(&peer.port.to_be_bytes());
                        }
                    }
                    bytes(compact)
                } else {
                    Value::List(
                        resp.peers
                            .iter()
                            .map(|peer| {
                                let mut entry = HashMap::new();
                                entry.insert(b"ip".to_vec(), bytes(peer.ip.to_string()));
                                entry.insert(b"peer id".to_vec(), bytes(peer.id.as_bytes()));
                                entry.insert(b"port".to_vec(), Value::Int(peer.port.into()));
                                Value::Dict(entry)
                            })
                            .collect(),
                    )
                };
                dict.insert(b"peers".to_vec(), peers);
            }
            Response::Error(msg) => {
                dict.insert(b"failure reason".to_vec(), bytes(msg));
            }
            Response::Warning(msg) => {
                dict.insert(b"warning message".to_vec(), bytes(msg));
            }
        }
        let body = serde_bencode::to_bytes(&Value::Dict(dict)).unwrap();
        let mut response =
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        response.extend_from_slice(&body);
        response
    });
    addr
}
