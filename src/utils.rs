use crate::error::TrackerError;
use crate::types::{InfoHash, Peer, PeerId};
use crate::PEER_ID_PREFIX;
use mio::{Events, Poll};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

pub fn generate_peer_id<R: Rng>(rng: &mut R) -> PeerId {
    let mut peer_id = [0u8; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    rng.fill(&mut peer_id[PEER_ID_PREFIX.len()..]);
    PeerId::new(peer_id)
}

pub fn generate_info_hash<R: Rng>(rng: &mut R) -> InfoHash {
    let mut info_hash = [0u8; 20];
    rng.fill(&mut info_hash);
    InfoHash::new(info_hash)
}

/// Hands out synthetic peers whose identities, ports and addresses never
/// repeat, so a returned peer can be told apart by any one of them.
#[derive(Debug)]
pub struct PeerFactory {
    rng: StdRng,
    ports: HashSet<u16>,
    ips: HashSet<Ipv4Addr>,
}

impl PeerFactory {
    pub fn new() -> PeerFactory {
        PeerFactory::with_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> PeerFactory {
        PeerFactory::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> PeerFactory {
        PeerFactory {
            rng,
            ports: HashSet::new(),
            ips: HashSet::new(),
        }
    }

    pub fn info_hash(&mut self) -> InfoHash {
        generate_info_hash(&mut self.rng)
    }

    pub fn peer(&mut self) -> Peer {
        let port = loop {
            let port = self.rng.gen_range(1024..=u16::MAX);
            if self.ports.insert(port) {
                break port;
            }
        };
        let ip = loop {
            let ip = Ipv4Addr::from(self.rng.gen::<u32>());
            if is_public(ip) && self.ips.insert(ip) {
                break ip;
            }
        };
        Peer::new(generate_peer_id(&mut self.rng), IpAddr::V4(ip), port)
    }
}

impl Default for PeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

// trackers commonly refuse to hand out private or reserved addresses
fn is_public(ip: Ipv4Addr) -> bool {
    let first = ip.octets()[0];
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || first == 0
        || first >= 240)
}

pub fn resolve(addr: &str) -> Result<SocketAddr, TrackerError> {
    addr.to_socket_addrs()
        .map_err(|e| TrackerError::Resolve {
            addr: addr.to_string(),
            source: Some(e),
        })?
        .next()
        .ok_or_else(|| TrackerError::Resolve {
            addr: addr.to_string(),
            source: None,
        })
}

/// Blocks until the registered source becomes ready or `deadline` passes.
pub(crate) fn wait_ready(
    poll: &mut Poll,
    events: &mut Events,
    deadline: Instant,
    phase: &'static str,
    timeout: Duration,
) -> Result<(), TrackerError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(TrackerError::Timeout { phase, timeout });
    }
    poll.poll(events, Some(remaining))
        .map_err(TrackerError::io(phase))?;
    if events.is_empty() && Instant::now() >= deadline {
        return Err(TrackerError::Timeout { phase, timeout });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_peer_id() {
        let mut rng = StdRng::seed_from_u64(0);
        let a = generate_peer_id(&mut rng);
        let b = generate_peer_id(&mut rng);
        assert_eq!(a.len(), 20);
        assert!(a.as_bytes().starts_with(PEER_ID_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_info_hash() {
        let a = generate_info_hash(&mut StdRng::seed_from_u64(0));
        let b = generate_info_hash(&mut StdRng::seed_from_u64(1));
        assert!(a.is_valid());
        assert_ne!(a, b);
    }

    #[test]
    fn test_peer_factory_never_repeats() {
        let mut factory = PeerFactory::seeded(42);
        let peers: Vec<Peer> = (0..64).map(|_| factory.peer()).collect();
        for (i, a) in peers.iter().enumerate() {
            assert!(a.port >= 1024);
            assert!(a.id.is_valid());
            for b in &peers[i + 1..] {
                assert_ne!(a.port, b.port);
                assert_ne!(a.ip, b.ip);
                assert_ne!(a.id, b.id);
            }
        }
    }

    #[test]
    fn test_public_addresses() {
        assert!(is_public(Ipv4Addr::new(1, 2, 3, 4)));
        assert!(!is_public(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!is_public(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_public(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_resolve() {
        assert_eq!(
            resolve("127.0.0.1:6969").unwrap(),
            "127.0.0.1:6969".parse().unwrap()
        );
        assert!(matches!(
            resolve("no port here"),
            Err(TrackerError::Resolve { .. })
        ));
    }
}
