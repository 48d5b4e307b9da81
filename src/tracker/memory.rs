use crate::error::TrackerError;
use crate::types::{
    AnnounceRequest, AnnounceResponse, Announcer, Event, InfoHash, Peer, PeerId, Response, Scrape,
    ScrapeRequest, ScrapeResponse, Scraper,
};
use crate::NUMWANT;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, PoisonError};

pub const INTERVAL: i64 = 1800;

#[derive(Clone, Copy, Debug)]
struct Behaviour {
    self_exclusion: bool,
    ip_override: bool,
    seeder_optimization: bool,
    validation: bool,
    peer_ids: bool,
    observed_ip: IpAddr,
}

impl Default for Behaviour {
    fn default() -> Self {
        Behaviour {
            self_exclusion: true,
            ip_override: true,
            seeder_optimization: true,
            validation: true,
            peer_ids: false,
            observed_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[derive(Clone, Debug)]
struct Entry {
    peer: Peer,
    left: i64,
}

#[derive(Debug, Default)]
struct Swarm {
    // announce order
    entries: Vec<Entry>,
    downloaded: i64,
}

impl Swarm {
    fn seeders(&self) -> i64 {
        self.entries.iter().filter(|e| e.left == 0).count() as i64
    }

    fn leechers(&self) -> i64 {
        self.entries.len() as i64 - self.seeders()
    }

    fn scrape(&self) -> Scrape {
        Scrape {
            complete: self.seeders(),
            downloaded: self.downloaded,
            incomplete: self.leechers(),
        }
    }
}

/// An honest swarm held in memory, with switches for the optional
/// behaviours a real tracker may or may not implement.
///
/// Clones share the same swarms, so several clients can talk to one tracker.
#[derive(Clone, Debug, Default)]
pub struct MemoryTracker {
    swarms: Arc<Mutex<HashMap<InfoHash, Swarm>>>,
    behaviour: Behaviour,
}

impl MemoryTracker {
    pub fn new() -> MemoryTracker {
        MemoryTracker::default()
    }

    /// Leave the requester out of its own peer list.
    pub fn with_self_exclusion(mut self, enabled: bool) -> Self {
        self.behaviour.self_exclusion = enabled;
        self
    }

    /// Honour the `ip` a peer declares instead of its source address.
    pub fn with_ip_override(mut self, enabled: bool) -> Self {
        self.behaviour.ip_override = enabled;
        self
    }

    /// Hand seeders only leechers.
    pub fn with_seeder_optimization(mut self, enabled: bool) -> Self {
        self.behaviour.seeder_optimization = enabled;
        self
    }

    /// Reject malformed identifiers, negative counters and unknown events.
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.behaviour.validation = enabled;
        self
    }

    /// Identify returned peers even in compact mode.
    pub fn with_peer_ids(mut self, enabled: bool) -> Self {
        self.behaviour.peer_ids = enabled;
        self
    }

    /// Source address assumed for announces made through [`Announcer`].
    pub fn with_observed_ip(mut self, ip: IpAddr) -> Self {
        self.behaviour.observed_ip = ip;
        self
    }

    pub fn observed_ip(&self) -> IpAddr {
        self.behaviour.observed_ip
    }

    fn validate(req: &AnnounceRequest) -> Option<String> {
        if !req.info_hash.is_valid() {
            return Some(format!("invalid info_hash length {}", req.info_hash.len()));
        }
        if !req.peer.id.is_valid() {
            return Some(format!("invalid peer_id length {}", req.peer.id.len()));
        }
        if req.uploaded < 0 || req.downloaded < 0 || req.left < 0 {
            return Some("negative transfer counter".to_string());
        }
        if req.event == Event::Invalid {
            return Some("unknown event".to_string());
        }
        None
    }

    /// Processes an announce as if it arrived from `observed_ip`.
    pub fn announce_from(&self, req: &AnnounceRequest, observed_ip: IpAddr) -> Response {
        let b = self.behaviour;
        if b.validation {
            if let Some(reason) = Self::validate(req) {
                log::debug!("memory tracker rejecting announce: {reason}");
                return Response::Error(reason);
            }
        }

        let ip = if b.ip_override && !req.peer.ip.is_unspecified() {
            req.peer.ip
        } else {
            observed_ip
        };
        let requester = Peer::new(req.peer.id.clone(), ip, req.peer.port);

        let mut swarms = self.swarms.lock().unwrap_or_else(PoisonError::into_inner);
        let swarm = swarms.entry(req.info_hash.clone()).or_default();
        let position = swarm.entries.iter().position(|e| e.peer.id == requester.id);

        match (req.event, position) {
            (Event::Stopped, Some(i)) => {
                swarm.entries.remove(i);
            }
            (Event::Stopped, None) => {}
            (event, Some(i)) => {
                swarm.entries[i] = Entry {
                    peer: requester.clone(),
                    left: req.left,
                };
                if event == Event::Completed {
                    swarm.downloaded += 1;
                }
            }
            (event, None) => {
                swarm.entries.push(Entry {
                    peer: requester.clone(),
                    left: req.left,
                });
                if event == Event::Completed {
                    swarm.downloaded += 1;
                }
            }
        }

        let numwant = (if req.numwant > 0 { req.numwant } else { NUMWANT }) as usize;
        let identify = b.peer_ids || !req.compact;
        let peers = if req.event == Event::Stopped {
            Vec::new()
        } else {
            swarm
                .entries
                .iter()
                .filter(|e| {
                    let is_requester = e.peer.id == requester.id;
                    if is_requester {
                        return !b.self_exclusion;
                    }
                    !(b.seeder_optimization && req.left == 0 && e.left == 0)
                })
                .take(numwant)
                .map(|e| {
                    let id = if identify {
                        e.peer.id.clone()
                    } else {
                        PeerId::default()
                    };
                    Peer::new(id, e.peer.ip, e.peer.port)
                })
                .collect()
        };

        Response::Announce(AnnounceResponse {
            interval: INTERVAL,
            min_interval: None,
            complete: swarm.seeders(),
            incomplete: swarm.leechers(),
            peers,
        })
    }
}

impl Announcer for MemoryTracker {
    fn announce(&mut self, req: &AnnounceRequest) -> Result<Response, TrackerError> {
        Ok(self.announce_from(req, self.behaviour.observed_ip))
    }
}

impl Scraper for MemoryTracker {
    /// An empty request scrapes every swarm.
    fn scrape(&mut self, req: &ScrapeRequest) -> Result<ScrapeResponse, TrackerError> {
        let swarms = self.swarms.lock().unwrap_or_else(PoisonError::into_inner);
        let files = if req.info_hashes.is_empty() {
            swarms
                .iter()
                .map(|(info_hash, swarm)| (info_hash.clone(), swarm.scrape()))
                .collect()
        } else {
            req.info_hashes
                .iter()
                .map(|info_hash| {
                    let scrape = swarms.get(info_hash).map(Swarm::scrape).unwrap_or_default();
                    (info_hash.clone(), scrape)
                })
                .collect()
        };
        Ok(ScrapeResponse { files })
    }
}
