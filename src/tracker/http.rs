use crate::error::TrackerError;
use crate::types::{AnnounceRequest, AnnounceResponse, Announcer, Peer, PeerId, Response};
use crate::utils::{resolve, wait_ready};
use crate::DEFAULT_TIMEOUT;
use httparse::Status;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use url::Url;

const STREAM: Token = Token(1);
const MAX_HEADERS: usize = 64;

/// Query parameters besides the two raw identifiers, which `serde_urlencoded`
/// cannot escape byte-wise.
#[derive(Debug, Serialize)]
struct Query<'a> {
    port: u16,
    uploaded: i64,
    downloaded: i64,
    left: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    compact: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    numwant: Option<i32>,
}

/// Builds the announce query string (without the leading `?`).
pub fn encode_query(req: &AnnounceRequest, compact: bool) -> Result<String, TrackerError> {
    let query = Query {
        port: req.peer.port,
        uploaded: req.uploaded,
        downloaded: req.downloaded,
        left: req.left,
        compact: compact.then_some(1),
        event: req.event.as_query_value(),
        ip: (!req.peer.ip.is_unspecified()).then(|| req.peer.ip.to_string()),
        numwant: (req.numwant != 0).then_some(req.numwant),
    };
    let rest = serde_urlencoded::to_string(&query)
        .map_err(|e| TrackerError::Unencodable(e.to_string()))?;
    Ok(format!(
        "info_hash={}&peer_id={}&{}",
        urlencoding::encode_binary(req.info_hash.as_bytes()),
        urlencoding::encode_binary(req.peer.id.as_bytes()),
        rest
    ))
}

/// The keys every announce response may carry. `peers` stays untyped until
/// we know which of the two layouts the tracker used.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<ByteBuf>,
    #[serde(default, rename = "warning message")]
    warning_message: Option<ByteBuf>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default, rename = "min interval")]
    min_interval: Option<i64>,
    #[serde(default)]
    complete: Option<i64>,
    #[serde(default)]
    incomplete: Option<i64>,
    #[serde(default)]
    peers: Option<Value>,
    #[serde(default)]
    peers6: Option<ByteBuf>,
}

fn message(field: Option<ByteBuf>) -> Option<String> {
    field
        .filter(|m| !m.is_empty())
        .map(|m| String::from_utf8_lossy(&m).into_owned())
}

/// Decodes a bencoded announce body into one of the three response shapes.
pub fn decode_announce(body: &[u8]) -> Result<Response, TrackerError> {
    let envelope: Envelope = serde_bencode::from_bytes(body)?;

    if let Some(reason) = message(envelope.failure_reason) {
        return Ok(Response::Error(reason));
    }
    if let Some(warning) = message(envelope.warning_message) {
        return Ok(Response::Warning(warning));
    }

    let mut peers = match envelope.peers {
        None => Vec::new(),
        Some(Value::Bytes(compact)) => compact_peers(&compact)?,
        Some(Value::List(entries)) => entries
            .into_iter()
            .map(dict_peer)
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(TrackerError::malformed(
                "announce",
                "peers is neither a byte string nor a list",
            ))
        }
    };
    if let Some(compact6) = envelope.peers6 {
        peers.extend(compact_peers6(&compact6)?);
    }

    Ok(Response::Announce(AnnounceResponse {
        interval: envelope.interval.unwrap_or(0),
        min_interval: envelope.min_interval,
        complete: envelope.complete.unwrap_or(0),
        incomplete: envelope.incomplete.unwrap_or(0),
        peers,
    }))
}

/// 4-byte IPv4 address followed by a 2-byte big-endian port.
pub fn compact_peers(bytes: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::malformed(
            "announce",
            format!("compact peers length {} is not a multiple of 6", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|v| {
            let ip = Ipv4Addr::new(v[0], v[1], v[2], v[3]);
            let port = u16::from_be_bytes([v[4], v[5]]);
            Peer::new(PeerId::default(), IpAddr::V4(ip), port)
        })
        .collect())
}

/// 16-byte IPv6 address followed by a 2-byte big-endian port.
pub fn compact_peers6(bytes: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    if bytes.len() % 18 != 0 {
        return Err(TrackerError::malformed(
            "announce",
            format!("compact peers6 length {} is not a multiple of 18", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(18)
        .map(|v| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&v[..16]);
            let port = u16::from_be_bytes([v[16], v[17]]);
            Peer::new(PeerId::default(), IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect())
}

fn dict_peer(entry: Value) -> Result<Peer, TrackerError> {
    let Value::Dict(mut dict) = entry else {
        return Err(TrackerError::malformed("announce", "peer entry is not a dictionary"));
    };
    let id = match dict.remove(b"peer id".as_slice()) {
        Some(Value::Bytes(id)) => PeerId::from_bytes(&id),
        None => PeerId::default(),
        Some(_) => return Err(TrackerError::malformed("announce", "peer id is not a string")),
    };
    let ip = match dict.remove(b"ip".as_slice()) {
        Some(Value::Bytes(ip)) => std::str::from_utf8(&ip)
            .ok()
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .ok_or_else(|| {
                TrackerError::malformed(
                    "announce",
                    format!("invalid peer ip {:?}", String::from_utf8_lossy(&ip)),
                )
            })?,
        _ => return Err(TrackerError::malformed("announce", "peer entry without ip")),
    };
    let port = match dict.remove(b"port".as_slice()) {
        Some(Value::Int(port)) => u16::try_from(port).map_err(|_| {
            TrackerError::malformed("announce", format!("peer port {port} out of range"))
        })?,
        _ => return Err(TrackerError::malformed("announce", "peer entry without port")),
    };
    Ok(Peer::new(id, ip, port))
}

/// Splits a raw HTTP/1.1 response into status code and decoded body.
///
/// Returns `Ok(None)` while more bytes are needed. Once `eof` is set the
/// response is either complete or malformed.
pub fn parse_http_response(raw: &[u8], eof: bool) -> Result<Option<(u16, Vec<u8>)>, TrackerError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    let header_len = match res.parse(raw) {
        Ok(Status::Complete(len)) => len,
        Ok(Status::Partial) => return incomplete(eof, "truncated HTTP header"),
        Err(e) => return Err(TrackerError::malformed("announce", format!("invalid HTTP response: {e}"))),
    };
    let status = res.code.unwrap_or(0);

    let mut content_length = None;
    let mut chunked = false;
    for header in res.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            let len = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| TrackerError::malformed("announce", "invalid Content-Length"))?;
            content_length = Some(len);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = String::from_utf8_lossy(header.value)
                .to_ascii_lowercase()
                .contains("chunked");
        }
    }
    log::trace!("HTTP {status}, {header_len} header bytes, chunked={chunked}, content_length={content_length:?}");

    let body = &raw[header_len..];
    if chunked {
        return Ok(decode_chunked(body, eof)?.map(|body| (status, body)));
    }
    match content_length {
        Some(len) if body.len() >= len => Ok(Some((status, body[..len].to_vec()))),
        Some(_) => incomplete(eof, "truncated HTTP body"),
        None if eof => Ok(Some((status, body.to_vec()))),
        None => Ok(None),
    }
}

fn incomplete<T>(eof: bool, detail: &str) -> Result<Option<T>, TrackerError> {
    if eof {
        Err(TrackerError::malformed("announce", detail))
    } else {
        Ok(None)
    }
}

fn decode_chunked(body: &[u8], eof: bool) -> Result<Option<Vec<u8>>, TrackerError> {
    let mut decoded = Vec::new();
    let mut pos = 0;
    loop {
        match httparse::parse_chunk_size(&body[pos..]) {
            Ok(Status::Complete((consumed, size))) => {
                pos += consumed;
                // trailers after the last chunk are ignored
                if size == 0 {
                    return Ok(Some(decoded));
                }
                let size = usize::try_from(size)
                    .map_err(|_| TrackerError::malformed("announce", "oversized chunk"))?;
                if body.len() < pos + size + 2 {
                    return incomplete(eof, "truncated chunked body");
                }
                decoded.extend_from_slice(&body[pos..pos + size]);
                if &body[pos + size..pos + size + 2] != b"\r\n" {
                    return Err(TrackerError::malformed("announce", "chunk not terminated by CRLF"));
                }
                pos += size + 2;
            }
            Ok(Status::Partial) => return incomplete(eof, "truncated chunked body"),
            Err(_) => return Err(TrackerError::malformed("announce", "invalid chunk size")),
        }
    }
}

/// Announce client for `http://` trackers.
#[derive(Debug)]
pub struct HttpTracker {
    url: Url,
    addr: SocketAddr,
    host: String,
    timeout: Duration,
    compact: Option<bool>,
    poll: Poll,
    events: Events,
}

impl HttpTracker {
    pub fn new(uri: &str) -> Result<Self, TrackerError> {
        let url = Url::parse(uri)?;
        if url.scheme() != "http" {
            return Err(TrackerError::UnsupportedScheme(url.scheme().to_string()));
        }
        let missing = || TrackerError::Resolve {
            addr: uri.to_string(),
            source: None,
        };
        let host_str = url.host_str().ok_or_else(missing)?;
        let port = url.port_or_known_default().ok_or_else(missing)?;
        let addr = resolve(&format!("{host_str}:{port}"))?;
        let host = match url.port() {
            Some(port) => format!("{host_str}:{port}"),
            None => host_str.to_string(),
        };
        let poll = Poll::new().map_err(TrackerError::io("poll"))?;
        Ok(HttpTracker {
            url,
            addr,
            host,
            timeout: DEFAULT_TIMEOUT,
            compact: None,
            poll,
            events: Events::with_capacity(8),
        })
    }

    /// Deadline for a whole request/response exchange.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends every announce in the given mode regardless of the request's
    /// own compact flag.
    pub fn override_compact(&mut self, compact: bool) {
        self.compact = Some(compact);
    }

    fn request(&self, query: &str) -> String {
        let mut target = self.url.path().to_string();
        target.push('?');
        if let Some(existing) = self.url.query() {
            target.push_str(existing);
            target.push('&');
        }
        target.push_str(query);
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: poke/{}\r\nAccept-Encoding: identity\r\nConnection: close\r\n\r\n",
            target,
            self.host,
            env!("CARGO_PKG_VERSION")
        )
    }

    fn exchange(&mut self, request: &[u8]) -> Result<(u16, Vec<u8>), TrackerError> {
        let deadline = Instant::now() + self.timeout;
        let mut stream = TcpStream::connect(self.addr).map_err(TrackerError::io("connect"))?;
        self.poll
            .registry()
            .register(&mut stream, STREAM, Interest::READABLE | Interest::WRITABLE)
            .map_err(TrackerError::io("connect"))?;
        let result = self.drive(&mut stream, request, deadline);
        if let Err(e) = self.poll.registry().deregister(&mut stream) {
            log::debug!("failed to deregister tracker stream: {e}");
        }
        result
    }

    fn drive(
        &mut self,
        stream: &mut TcpStream,
        request: &[u8],
        deadline: Instant,
    ) -> Result<(u16, Vec<u8>), TrackerError> {
        let timeout = self.timeout;

        // a non-blocking connect is done once the socket turns writable
        loop {
            wait_ready(&mut self.poll, &mut self.events, deadline, "connect", timeout)?;
            if let Some(e) = stream.take_error().map_err(TrackerError::io("connect"))? {
                return Err(TrackerError::Io {
                    phase: "connect",
                    source: e,
                });
            }
            match stream.peer_addr() {
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::NotConnected => continue,
                Err(e) => return Err(TrackerError::Io { phase: "connect", source: e }),
            }
        }

        let mut written = 0;
        while written < request.len() {
            match stream.write(&request[written..]) {
                Ok(0) => {
                    return Err(TrackerError::Io {
                        phase: "announce",
                        source: ErrorKind::WriteZero.into(),
                    })
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    wait_ready(&mut self.poll, &mut self.events, deadline, "announce", timeout)?
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TrackerError::Io { phase: "announce", source: e }),
            }
        }

        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    return parse_http_response(&raw, true)?.ok_or_else(|| {
                        TrackerError::malformed("announce", "truncated HTTP response")
                    })
                }
                Ok(n) => {
                    raw.extend_from_slice(&buf[..n]);
                    if let Some(response) = parse_http_response(&raw, false)? {
                        return Ok(response);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    wait_ready(&mut self.poll, &mut self.events, deadline, "announce", timeout)?
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TrackerError::Io { phase: "announce", source: e }),
            }
        }
    }
}

impl Announcer for HttpTracker {
    fn announce(&mut self, req: &AnnounceRequest) -> Result<Response, TrackerError> {
        let compact = self.compact.unwrap_or(req.compact);
        let request = self.request(&encode_query(req, compact)?);
        log::debug!("announce request: {}", request.trim_end());

        let (status, body) = self.exchange(request.as_bytes())?;
        log::debug!("HTTP {status}, body: {:?}", String::from_utf8_lossy(&body));

        if !(200..300).contains(&status) {
            // a refusal may still carry a bencoded failure reason
            if let Ok(Response::Error(reason)) = decode_announce(&body) {
                return Ok(Response::Error(reason));
            }
            return Err(TrackerError::HttpStatus(status));
        }
        decode_announce(&body)
    }
}
