//! Capability detectors and swarm bookkeeping checks.
//!
//! Every probe works on a fresh info_hash with fresh peers, so probes never
//! see each other's swarms. Peers handed out by [`PeerFactory`] have unique
//! ports, which lets a returned peer be recognised even when the response
//! carries neither its identity nor the address it declared.

use crate::error::TrackerError;
use crate::probe::result::{Capabilities, Capability, ProbeError};
use crate::types::{AnnounceRequest, AnnounceResponse, Announcer, Event, InfoHash, Peer, Response};
use crate::utils::PeerFactory;

/// What a probe gets to work with.
pub struct ProbeContext<'a> {
    client: &'a mut dyn Announcer,
    factory: &'a mut PeerFactory,
    capabilities: Capabilities,
}

impl<'a> ProbeContext<'a> {
    pub fn new(
        client: &'a mut dyn Announcer,
        factory: &'a mut PeerFactory,
        capabilities: Capabilities,
    ) -> ProbeContext<'a> {
        ProbeContext {
            client,
            factory,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn info_hash(&mut self) -> InfoHash {
        self.factory.info_hash()
    }

    pub fn peer(&mut self) -> Peer {
        self.factory.peer()
    }

    fn self_excluding(&self) -> bool {
        self.capabilities.has(Capability::SelfExclusion)
    }

    /// Addresses are only worth comparing once the tracker is known to keep
    /// the ones peers declare.
    fn compare_ip(&self) -> bool {
        self.capabilities.has(Capability::IpSpoofing)
    }

    /// Sends `req` without interpreting the answer.
    pub fn exchange(&mut self, req: &AnnounceRequest) -> Result<Response, TrackerError> {
        self.client.announce(req)
    }

    /// Sends `req` and insists on a successful announce response that
    /// respects numwant.
    pub fn announce(
        &mut self,
        req: &AnnounceRequest,
        context: &'static str,
    ) -> Result<AnnounceResponse, ProbeError> {
        let resp = match self.exchange(req) {
            Ok(Response::Announce(resp)) => resp,
            Ok(Response::Error(msg)) => return Err(ProbeError::Rejected(msg)),
            Ok(Response::Warning(msg)) => return Err(ProbeError::Warned(msg)),
            Err(source) => {
                log::warn!("{context}: {source}");
                return Err(ProbeError::Transport { context, source });
            }
        };
        if req.numwant > 0 && resp.peers.len() > req.numwant as usize {
            return Err(ProbeError::violation(format!(
                "{context}: {} peers returned for numwant {}",
                resp.peers.len(),
                req.numwant
            )));
        }
        Ok(resp)
    }

    /// The peer list minus the requester's own entry, which a tracker
    /// without self-exclusion is expected to include.
    fn others(&self, peers: Vec<Peer>, requester: &Peer) -> Vec<Peer> {
        if self.self_excluding() {
            return peers;
        }
        let compare_ip = self.compare_ip();
        let mut peers = peers;
        if let Some(i) = peers.iter().position(|p| p.matches(requester, compare_ip)) {
            peers.remove(i);
        }
        peers
    }
}

fn request(info_hash: &InfoHash, peer: &Peer, left: i64) -> AnnounceRequest {
    let mut req = AnnounceRequest::new(info_hash.clone(), peer.clone());
    req.left = left;
    req
}

/// Whether `got` holds exactly one match for every peer in `expected`.
fn same_peers(got: &[Peer], expected: &[&Peer], compare_ip: bool) -> bool {
    if got.len() != expected.len() {
        return false;
    }
    let mut used = vec![false; got.len()];
    expected.iter().all(|want| {
        let hit = got
            .iter()
            .enumerate()
            .position(|(i, p)| !used[i] && p.matches(want, compare_ip));
        match hit {
            Some(i) => {
                used[i] = true;
                true
            }
            None => false,
        }
    })
}

fn describe(peers: &[Peer]) -> String {
    let listed: Vec<String> = peers.iter().map(Peer::to_string).collect();
    format!("[{}]", listed.join(", "))
}

/// Does the tracker leave the requester out of its own peer list?
pub fn self_exclusion(ctx: &mut ProbeContext<'_>) -> Result<bool, ProbeError> {
    let info_hash = ctx.info_hash();
    let peer = ctx.peer();
    let mut req = request(&info_hash, &peer, 100);

    let resp = ctx.announce(&req, "first announce")?;
    match resp.peers.as_slice() {
        [] => {}
        [only] if only.matches(&peer, false) => return Ok(false),
        peers => {
            return Err(ProbeError::violation(format!(
                "first announce to a new swarm returned foreign peers {}",
                describe(peers)
            )))
        }
    }

    req.left = 50;
    req.event = Event::None;
    let resp = ctx.announce(&req, "second announce")?;
    match resp.peers.as_slice() {
        [] => Ok(true),
        [only] if only.matches(&peer, false) => Ok(false),
        [_] => Err(ProbeError::violation(
            "second announce with equal peer returned unknown peer",
        )),
        peers => Err(ProbeError::violation(format!(
            "second announce with equal peer returned {} peers",
            peers.len()
        ))),
    }
}

/// Does the tracker hand out the `ip` a peer declares?
pub fn ip_spoofing(ctx: &mut ProbeContext<'_>) -> Result<bool, ProbeError> {
    let info_hash = ctx.info_hash();
    let leecher1 = ctx.peer();
    let leecher2 = ctx.peer();

    ctx.announce(&request(&info_hash, &leecher1, 100), "announce of first peer")?;
    let resp = ctx.announce(&request(&info_hash, &leecher2, 120), "announce of second peer")?;

    let declared: Vec<&Peer> = if ctx.self_excluding() {
        vec![&leecher1]
    } else {
        vec![&leecher1, &leecher2]
    };
    if !same_peers(&resp.peers, &declared, false) {
        return Err(ProbeError::violation(format!(
            "announce of second peer returned {}, expected {} known peer(s)",
            describe(&resp.peers),
            declared.len()
        )));
    }

    Ok(resp
        .peers
        .iter()
        .any(|p| declared.iter().any(|d| p.matches(d, true))))
}

/// Are seeders spared the other seeders?
pub fn optimized_seeder_response(ctx: &mut ProbeContext<'_>) -> Result<bool, ProbeError> {
    let info_hash = ctx.info_hash();
    let leecher = ctx.peer();
    let seeder1 = ctx.peer();
    let seeder2 = ctx.peer();

    ctx.announce(&request(&info_hash, &leecher, 100), "leecher announce")?;
    ctx.announce(&request(&info_hash, &seeder1, 0), "first seeder announce")?;
    let resp = ctx.announce(&request(&info_hash, &seeder2, 0), "second seeder announce")?;

    let peers = ctx.others(resp.peers, &seeder2);
    if !peers.iter().any(|p| p.matches(&leecher, false)) {
        return Err(ProbeError::violation(format!(
            "second seeder was not given the leecher, got {}",
            describe(&peers)
        )));
    }
    if same_peers(&peers, &[&leecher], false) {
        Ok(true)
    } else if same_peers(&peers, &[&leecher, &seeder1], false) {
        Ok(false)
    } else {
        Err(ProbeError::violation(format!(
            "second seeder got unknown peers {}",
            describe(&peers)
        )))
    }
}

/// One leecher joins an empty swarm.
pub fn basic_announce(ctx: &mut ProbeContext<'_>) -> Result<(), ProbeError> {
    let info_hash = ctx.info_hash();
    let peer = ctx.peer();
    let resp = ctx.announce(&request(&info_hash, &peer, 100), "leecher announce")?;

    if resp.complete != 0 || resp.incomplete != 1 {
        return Err(ProbeError::violation(format!(
            "first announce reports {} seeders and {} leechers, expected 0 and 1",
            resp.complete, resp.incomplete
        )));
    }
    if ctx.self_excluding() {
        if !resp.peers.is_empty() {
            return Err(ProbeError::violation("first announce is not empty"));
        }
    } else if !same_peers(&resp.peers, &[&peer], ctx.compare_ip()) {
        return Err(ProbeError::violation(format!(
            "expected only the announcing peer, got {}",
            describe(&resp.peers)
        )));
    }
    Ok(())
}

/// One seeder joins an empty swarm.
pub fn basic_seeder_announce(ctx: &mut ProbeContext<'_>) -> Result<(), ProbeError> {
    let info_hash = ctx.info_hash();
    let peer = ctx.peer();
    let resp = ctx.announce(&request(&info_hash, &peer, 0), "seeder announce")?;

    if resp.complete != 1 || resp.incomplete != 0 {
        return Err(ProbeError::violation(format!(
            "first announce reports {} seeders and {} leechers, expected 1 and 0",
            resp.complete, resp.incomplete
        )));
    }
    let others = ctx.others(resp.peers, &peer);
    if !others.is_empty() {
        return Err(ProbeError::violation(format!(
            "first announce returned foreign peers {}",
            describe(&others)
        )));
    }
    Ok(())
}

/// Builds a two-leecher, two-seeder swarm and checks the peer list and the
/// counts after every step.
pub fn returned_peers(ctx: &mut ProbeContext<'_>) -> Result<(), ProbeError> {
    let info_hash = ctx.info_hash();
    let l1 = ctx.peer();
    let l2 = ctx.peer();
    let s1 = ctx.peer();
    let s2 = ctx.peer();
    let optimized = ctx.capabilities().has(Capability::OptimizedSeederResponse);
    let compare_ip = ctx.compare_ip();

    let mut rejoin = request(&info_hash, &l1, 80);
    rejoin.event = Event::None;
    let s2_sees: Vec<&Peer> = if optimized {
        vec![&l1, &l2]
    } else {
        vec![&l1, &l2, &s1]
    };

    let steps: [(&str, AnnounceRequest, Vec<&Peer>, (i64, i64)); 5] = [
        ("first leecher", request(&info_hash, &l1, 100), vec![], (0, 1)),
        ("second leecher", request(&info_hash, &l2, 100), vec![&l1], (0, 2)),
        ("first seeder", request(&info_hash, &s1, 0), vec![&l1, &l2], (1, 2)),
        ("second seeder", request(&info_hash, &s2, 0), s2_sees, (2, 2)),
        ("first leecher again", rejoin, vec![&l2, &s1, &s2], (2, 2)),
    ];

    for (step, req, expected, (complete, incomplete)) in steps {
        let resp = ctx.announce(&req, "swarm announce")?;
        log::debug!("{step}: {}", describe(&resp.peers));
        if (resp.complete, resp.incomplete) != (complete, incomplete) {
            return Err(ProbeError::violation(format!(
                "{step}: reports {} seeders and {} leechers, expected {complete} and {incomplete}",
                resp.complete, resp.incomplete
            )));
        }
        let peers = ctx.others(resp.peers, &req.peer);
        if !same_peers(&peers, &expected, compare_ip) {
            let want: Vec<Peer> = expected.into_iter().cloned().collect();
            return Err(ProbeError::violation(format!(
                "{step}: got peers {}, expected {}",
                describe(&peers),
                describe(&want)
            )));
        }
    }
    Ok(())
}

/// Can the tracker answer in the given HTTP peer-list layout?
///
/// The caller points the context at a client that forces `compact`.
pub fn mode_support(ctx: &mut ProbeContext<'_>, compact: bool) -> Result<bool, ProbeError> {
    let info_hash = ctx.info_hash();
    let leecher1 = ctx.peer();
    let leecher2 = ctx.peer();

    let mut req = request(&info_hash, &leecher1, 100);
    req.compact = compact;
    ctx.announce(&req, "announce of first peer")?;
    req.peer = leecher2;
    let resp = ctx.announce(&req, "announce of second peer")?;

    match resp.peers.len() {
        0 => {
            return Err(ProbeError::violation(
                "announce did not return the other known leecher",
            ))
        }
        1 | 2 => {}
        _ => return Err(ProbeError::violation("announce returned too many peers")),
    }
    if !resp.peers.iter().any(|p| p.matches(&leecher1, false)) {
        return Err(ProbeError::violation("announce returned unknown peer"));
    }
    if !compact && resp.peers.iter().any(|p| p.id.is_empty()) {
        return Err(ProbeError::violation(
            "non-compact response does not identify its peers",
        ));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTracker;
    use crate::tracker::memory::MemoryTracker;

    fn detect<A: Announcer>(
        tracker: &mut A,
        caps: Capabilities,
        probe: fn(&mut ProbeContext<'_>) -> Result<bool, ProbeError>,
    ) -> Result<bool, ProbeError> {
        let mut factory = PeerFactory::seeded(11);
        let mut ctx = ProbeContext::new(tracker, &mut factory, caps);
        probe(&mut ctx)
    }

    fn check<A: Announcer>(
        tracker: &mut A,
        caps: Capabilities,
        probe: fn(&mut ProbeContext<'_>) -> Result<(), ProbeError>,
    ) -> Result<(), ProbeError> {
        let mut factory = PeerFactory::seeded(12);
        let mut ctx = ProbeContext::new(tracker, &mut factory, caps);
        probe(&mut ctx)
    }

    fn caps(self_exclusion: bool, ip_spoofing: bool, optimized: bool) -> Capabilities {
        Capabilities {
            self_exclusion: Some(self_exclusion),
            ip_spoofing: Some(ip_spoofing),
            optimized_seeder_response: Some(optimized),
        }
    }

    #[test]
    fn test_self_exclusion() {
        let mut excluding = MemoryTracker::new();
        assert!(detect(&mut excluding, Capabilities::default(), self_exclusion).unwrap());

        let mut echoing = MemoryTracker::new().with_self_exclusion(false);
        assert!(!detect(&mut echoing, Capabilities::default(), self_exclusion).unwrap());
    }

    #[test]
    fn test_self_exclusion_too_many_peers() {
        let mut factory = PeerFactory::seeded(99);
        let strangers = vec![factory.peer(), factory.peer()];
        let mut tracker = ScriptedTracker::new(vec![
            ScriptedTracker::peers(vec![]),
            ScriptedTracker::peers(strangers),
        ]);
        let err = detect(&mut tracker, Capabilities::default(), self_exclusion).unwrap_err();
        assert!(matches!(err, ProbeError::Violation(_)));
        assert_eq!(tracker.requests().len(), 2);
        assert_eq!(tracker.requests()[1].event, Event::None);
        assert_eq!(tracker.requests()[1].left, 50);
    }

    #[test]
    fn test_tracker_error_is_surfaced() {
        let mut tracker =
            ScriptedTracker::new(vec![Ok(Response::Error("torrent not registered".into()))]);
        let err = detect(&mut tracker, Capabilities::default(), self_exclusion).unwrap_err();
        assert!(matches!(err, ProbeError::Rejected(msg) if msg == "torrent not registered"));
    }

    #[test]
    fn test_ip_spoofing() {
        let mut honest = MemoryTracker::new();
        assert!(detect(&mut honest, caps(true, false, false), ip_spoofing).unwrap());

        let mut ignoring = MemoryTracker::new().with_ip_override(false);
        assert!(!detect(&mut ignoring, caps(true, false, false), ip_spoofing).unwrap());

        let mut echoing = MemoryTracker::new().with_self_exclusion(false);
        assert!(detect(&mut echoing, caps(false, false, false), ip_spoofing).unwrap());

        // a self-excluding tracker judged as echoing: expected shape mismatch
        let mut excluding = MemoryTracker::new();
        assert!(detect(&mut excluding, caps(false, false, false), ip_spoofing).is_err());
    }

    #[test]
    fn test_optimized_seeder_response() {
        let mut optimized = MemoryTracker::new();
        assert!(detect(&mut optimized, caps(true, true, false), optimized_seeder_response).unwrap());

        let mut plain = MemoryTracker::new().with_seeder_optimization(false);
        assert!(!detect(&mut plain, caps(true, true, false), optimized_seeder_response).unwrap());

        let mut echoing = MemoryTracker::new().with_self_exclusion(false);
        assert!(detect(&mut echoing, caps(false, true, false), optimized_seeder_response).unwrap());
    }

    #[test]
    fn test_basic_announces() {
        let mut honest = MemoryTracker::new();
        check(&mut honest, caps(true, true, true), basic_announce).unwrap();
        check(&mut honest, caps(true, true, true), basic_seeder_announce).unwrap();

        let mut echoing = MemoryTracker::new().with_self_exclusion(false);
        check(&mut echoing, caps(false, true, true), basic_announce).unwrap();
        check(&mut echoing, caps(false, true, true), basic_seeder_announce).unwrap();
        assert!(check(&mut echoing, caps(true, true, true), basic_announce).is_err());
    }

    #[test]
    fn test_returned_peers() {
        let mut honest = MemoryTracker::new();
        check(&mut honest, caps(true, true, true), returned_peers).unwrap();

        let mut quirky = MemoryTracker::new()
            .with_self_exclusion(false)
            .with_ip_override(false)
            .with_seeder_optimization(false);
        check(&mut quirky, caps(false, false, false), returned_peers).unwrap();

        // claiming optimization the tracker lacks must surface at the second seeder
        let mut plain = MemoryTracker::new().with_seeder_optimization(false);
        let err = check(&mut plain, caps(true, true, true), returned_peers).unwrap_err();
        assert!(err.to_string().starts_with("second seeder"));
    }

    #[test]
    fn test_numwant_is_enforced() {
        let mut factory = PeerFactory::seeded(5);
        let crowd: Vec<Peer> = (0..60).map(|_| factory.peer()).collect();
        let mut tracker = ScriptedTracker::new(vec![ScriptedTracker::peers(crowd)]);
        let err = check(&mut tracker, caps(true, true, true), basic_announce).unwrap_err();
        assert!(err.to_string().contains("numwant"));
    }

    #[test]
    fn test_mode_support() {
        let mut tracker = MemoryTracker::new();
        assert!(detect(&mut tracker, Capabilities::default(), |ctx| mode_support(ctx, true)).unwrap());
        assert!(detect(&mut tracker, Capabilities::default(), |ctx| mode_support(ctx, false)).unwrap());

        // compact-only answers cannot serve a non-compact request; replay
        // the factory `detect` uses to learn the first leecher's port
        let mut factory = PeerFactory::seeded(11);
        factory.info_hash();
        let mut anonymous = factory.peer();
        anonymous.id = Default::default();
        let mut tracker = ScriptedTracker::new(vec![
            ScriptedTracker::peers(vec![]),
            ScriptedTracker::peers(vec![anonymous]),
        ]);
        let err = detect(&mut tracker, Capabilities::default(), |ctx| mode_support(ctx, false))
            .unwrap_err();
        assert!(err.to_string().contains("does not identify"));
    }
}
