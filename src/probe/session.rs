use crate::error::TrackerError;
use crate::probe::announce::{self, ProbeContext};
use crate::probe::result::{
    Capabilities, Capability, HttpResult, Outcome, ProbeError, Test, TrackerResult,
};
use crate::probe::validation::{self, Malformation};
use crate::tracker::http::HttpTracker;
use crate::tracker::udp::{TransactionIds, UdpTracker};
use crate::types::Announcer;
use crate::utils::PeerFactory;
use std::time::Duration;

type Detector = fn(&mut ProbeContext<'_>) -> Result<bool, ProbeError>;
type Check = fn(&mut ProbeContext<'_>) -> Result<(), ProbeError>;

#[derive(Clone, Copy)]
pub enum Step {
    /// decides a capability that later probes read
    Detect(Capability, Detector),
    Check(Check),
    Reject(Malformation),
}

#[derive(Clone, Copy)]
pub struct Probe {
    pub name: &'static str,
    /// verdicts that must be known before the probe can run
    pub requires: &'static [Capability],
    pub step: Step,
}

const ALL_CAPABILITIES: &[Capability] = &[
    Capability::SelfExclusion,
    Capability::IpSpoofing,
    Capability::OptimizedSeederResponse,
];

/// Probes in the order they run. Detectors come first since everything
/// after them reads their verdicts.
pub const PROBES: &[Probe] = &[
    Probe {
        name: "self_exclusion",
        requires: &[],
        step: Step::Detect(Capability::SelfExclusion, announce::self_exclusion),
    },
    Probe {
        name: "ip_spoofing",
        requires: &[Capability::SelfExclusion],
        step: Step::Detect(Capability::IpSpoofing, announce::ip_spoofing),
    },
    Probe {
        name: "optimized_seeder_response",
        requires: &[Capability::SelfExclusion],
        step: Step::Detect(
            Capability::OptimizedSeederResponse,
            announce::optimized_seeder_response,
        ),
    },
    Probe {
        name: "basic_announce",
        requires: &[Capability::SelfExclusion],
        step: Step::Check(announce::basic_announce),
    },
    Probe {
        name: "basic_seeder_announce",
        requires: &[Capability::SelfExclusion],
        step: Step::Check(announce::basic_seeder_announce),
    },
    Probe {
        name: "returned_peers",
        requires: ALL_CAPABILITIES,
        step: Step::Check(announce::returned_peers),
    },
    Probe {
        name: "invalid_short_info_hash",
        requires: &[],
        step: Step::Reject(Malformation::ShortInfoHash),
    },
    Probe {
        name: "invalid_long_info_hash",
        requires: &[],
        step: Step::Reject(Malformation::LongInfoHash),
    },
    Probe {
        name: "invalid_short_peer_id",
        requires: &[],
        step: Step::Reject(Malformation::ShortPeerId),
    },
    Probe {
        name: "invalid_long_peer_id",
        requires: &[],
        step: Step::Reject(Malformation::LongPeerId),
    },
    Probe {
        name: "invalid_negative_uploaded",
        requires: &[],
        step: Step::Reject(Malformation::NegativeUploaded),
    },
    Probe {
        name: "invalid_negative_downloaded",
        requires: &[],
        step: Step::Reject(Malformation::NegativeDownloaded),
    },
    Probe {
        name: "invalid_negative_left",
        requires: &[],
        step: Step::Reject(Malformation::NegativeLeft),
    },
    Probe {
        name: "invalid_event",
        requires: &[],
        step: Step::Reject(Malformation::InvalidEvent),
    },
];

pub const COMPACT_PROBE: &str = "compact_announce";
pub const NON_COMPACT_PROBE: &str = "non_compact_announce";

impl Probe {
    fn skip_reason(&self, caps: &Capabilities, fixed_layout: bool) -> Option<String> {
        if let Some(missing) = self.requires.iter().find(|c| caps.get(**c).is_none()) {
            return Some(format!("{missing} was not determined"));
        }
        match self.step {
            Step::Reject(m) if fixed_layout && !m.fits_fixed_layout() => {
                Some("not expressible in a fixed-layout UDP announce".to_string())
            }
            _ => None,
        }
    }

    fn run(&self, ctx: &mut ProbeContext<'_>, caps: &mut Capabilities) -> Outcome {
        match self.step {
            Step::Detect(capability, detect) => match detect(ctx) {
                Ok(verdict) => {
                    caps.set(capability, verdict);
                    Outcome::Detected(verdict)
                }
                Err(e) => Outcome::from_error(e),
            },
            Step::Check(check) => match check(ctx) {
                Ok(()) => Outcome::Passed,
                Err(e) => Outcome::from_error(e),
            },
            Step::Reject(malformation) => match validation::rejects(ctx, malformation) {
                Ok(()) => Outcome::Passed,
                Err(e) => Outcome::from_error(e),
            },
        }
    }
}

/// Runs every probe in [`PROBES`] against one client.
///
/// `fixed_layout` marks a transport that can only carry 20-byte identifiers.
/// A probe that fails is recorded and the session moves on; probes whose
/// required verdicts are missing are recorded as skipped.
pub fn run_all<A: Announcer>(client: &mut A, fixed_layout: bool, result: &mut TrackerResult) {
    run_with_factory(client, &mut PeerFactory::new(), fixed_layout, result)
}

fn run_with_factory<A: Announcer>(
    client: &mut A,
    factory: &mut PeerFactory,
    fixed_layout: bool,
    result: &mut TrackerResult,
) {
    for probe in PROBES {
        if let Some(reason) = probe.skip_reason(&result.capabilities, fixed_layout) {
            result.record(Test::new(probe.name, Outcome::Skipped(reason)));
            continue;
        }
        log::info!("running {}", probe.name);
        let mut caps = result.capabilities;
        let outcome = {
            let mut ctx = ProbeContext::new(&mut *client, &mut *factory, caps);
            probe.run(&mut ctx, &mut caps)
        };
        result.capabilities = caps;
        result.record(Test::new(probe.name, outcome));
    }
}

/// Probes both HTTP peer-list layouts, then runs the whole battery in the
/// layout the tracker supports, preferring compact.
///
/// `connect(compact)` must return a fresh client pinned to that layout.
pub fn run_http_session<A, F>(mut connect: F) -> Result<HttpResult, TrackerError>
where
    A: Announcer,
    F: FnMut(bool) -> Result<A, TrackerError>,
{
    let mut factory = PeerFactory::new();
    let mut result = HttpResult::default();

    for (name, compact) in [(COMPACT_PROBE, true), (NON_COMPACT_PROBE, false)] {
        log::info!("running {name}");
        let mut client = connect(compact)?;
        let mut ctx = ProbeContext::new(&mut client, &mut factory, Capabilities::default());
        let outcome = match announce::mode_support(&mut ctx, compact) {
            Ok(supported) => Outcome::Detected(supported),
            Err(e) => Outcome::from_error(e),
        };
        let supported = matches!(outcome, Outcome::Detected(true));
        if compact {
            result.supports_compact = supported;
        } else {
            result.supports_non_compact = supported;
        }
        result.tracker.record(Test::new(name, outcome));
    }

    if !result.supports_compact && !result.supports_non_compact {
        for probe in PROBES {
            result.tracker.record(Test::new(
                probe.name,
                Outcome::Skipped("tracker supports neither compact nor non-compact announces".to_string()),
            ));
        }
        return Ok(result);
    }

    let mut client = connect(result.supports_compact)?;
    run_with_factory(&mut client, &mut factory, false, &mut result.tracker);
    Ok(result)
}

/// Probes the BEP 15 tracker at `addr` (`host:port` or a `udp://` URL).
pub fn test_udp_tracker(addr: &str, timeout: Duration) -> Result<TrackerResult, TrackerError> {
    let mut client = UdpTracker::with_transaction_ids(addr, TransactionIds::new())?;
    client.set_timeout(timeout);
    log::info!("probing UDP tracker at {}", client.addr());

    let mut result = TrackerResult::default();
    run_all(&mut client, true, &mut result);
    Ok(result)
}

/// Probes the HTTP tracker behind `announce_uri`.
pub fn test_http_tracker(announce_uri: &str, timeout: Duration) -> Result<HttpResult, TrackerError> {
    // surface a bad URI before any probe is recorded
    HttpTracker::new(announce_uri)?;
    log::info!("probing HTTP tracker at {announce_uri}");

    run_http_session(|compact| {
        let mut client = HttpTracker::new(announce_uri)?;
        client.set_timeout(timeout);
        client.override_compact(compact);
        Ok(client)
    })
}
