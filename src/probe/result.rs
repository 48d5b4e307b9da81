use crate::error::TrackerError;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::fmt;
use thiserror::Error;

/// Optional tracker behaviours the engine detects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// the requester is left out of its own peer list
    SelfExclusion,
    /// a declared `ip` overrides the source address
    IpSpoofing,
    /// seeders are only handed leechers
    OptimizedSeederResponse,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Capability::SelfExclusion => "self_exclusion",
            Capability::IpSpoofing => "ip_spoofing",
            Capability::OptimizedSeederResponse => "optimized_seeder_response",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Verdicts gathered so far. `None` means the detector did not run or could
/// not decide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Capabilities {
    pub self_exclusion: Option<bool>,
    pub ip_spoofing: Option<bool>,
    pub optimized_seeder_response: Option<bool>,
}

impl Capabilities {
    pub fn get(&self, capability: Capability) -> Option<bool> {
        match capability {
            Capability::SelfExclusion => self.self_exclusion,
            Capability::IpSpoofing => self.ip_spoofing,
            Capability::OptimizedSeederResponse => self.optimized_seeder_response,
        }
    }

    pub fn set(&mut self, capability: Capability, verdict: bool) {
        let slot = match capability {
            Capability::SelfExclusion => &mut self.self_exclusion,
            Capability::IpSpoofing => &mut self.ip_spoofing,
            Capability::OptimizedSeederResponse => &mut self.optimized_seeder_response,
        };
        *slot = Some(verdict);
    }

    /// True only for a positive verdict.
    pub fn has(&self, capability: Capability) -> bool {
        self.get(capability) == Some(true)
    }
}

/// Why a probe did not pass.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// the exchange itself failed
    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: TrackerError,
    },
    #[error("tracker returned error: {0}")]
    Rejected(String),
    #[error("tracker returned warning: {0}")]
    Warned(String),
    /// the response decoded fine but contradicts the swarm we built
    #[error("{0}")]
    Violation(String),
}

impl ProbeError {
    pub(crate) fn violation(detail: impl Into<String>) -> ProbeError {
        ProbeError::Violation(detail.into())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ProbeError::Transport { .. })
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// a check whose invariants all held
    Passed,
    /// a detector reached a verdict
    Detected(bool),
    /// the tracker answered, but not the way a conformant one would
    Failed(ProbeError),
    /// the tracker could not be talked to
    Errored(ProbeError),
    Skipped(String),
}

impl Outcome {
    pub fn from_error(err: ProbeError) -> Outcome {
        if err.is_transport() {
            Outcome::Errored(err)
        } else {
            Outcome::Failed(err)
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Detected(_) => "detected",
            Outcome::Failed(_) => "failed",
            Outcome::Errored(_) => "error",
            Outcome::Skipped(_) => "skipped",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => f.write_str("passed"),
            Outcome::Detected(verdict) => write!(f, "{verdict}"),
            Outcome::Failed(e) => write!(f, "failed: {e}"),
            Outcome::Errored(e) => write!(f, "error: {e}"),
            Outcome::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

/// One entry in the session log.
#[derive(Debug)]
pub struct Test {
    pub name: &'static str,
    pub outcome: Outcome,
}

impl Test {
    pub fn new(name: &'static str, outcome: Outcome) -> Test {
        Test { name, outcome }
    }

    pub fn ran(&self) -> bool {
        !matches!(self.outcome, Outcome::Skipped(_))
    }

    pub fn not_run_reason(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Skipped(reason) => Some(reason.as_str()),
            _ => None,
        }
    }

    pub fn verdict(&self) -> Option<bool> {
        match self.outcome {
            Outcome::Detected(verdict) => Some(verdict),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ProbeError> {
        match &self.outcome {
            Outcome::Failed(e) | Outcome::Errored(e) => Some(e),
            _ => None,
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self.outcome, Outcome::Passed | Outcome::Detected(_))
    }
}

impl Serialize for Test {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Test", 6)?;
        state.serialize_field("name", self.name)?;
        state.serialize_field("run", &self.ran())?;
        state.serialize_field("outcome", self.outcome.label())?;
        state.serialize_field("result", &self.verdict())?;
        state.serialize_field("error", &self.error().map(|e| e.to_string()))?;
        state.serialize_field("not_run_reason", &self.not_run_reason())?;
        state.end()
    }
}

/// Everything one session learned about a tracker.
#[derive(Debug, Default, serde::Serialize)]
pub struct TrackerResult {
    pub capabilities: Capabilities,
    pub tests: Vec<Test>,
}

impl TrackerResult {
    pub(crate) fn record(&mut self, test: Test) {
        log::info!("{}: {}", test.name, test.outcome);
        self.tests.push(test);
    }

    pub fn test(&self, name: &str) -> Option<&Test> {
        self.tests.iter().find(|t| t.name == name)
    }

    pub fn supports_self_exclusion(&self) -> bool {
        self.capabilities.has(Capability::SelfExclusion)
    }

    pub fn supports_ip_spoofing(&self) -> bool {
        self.capabilities.has(Capability::IpSpoofing)
    }

    pub fn supports_optimized_seeder_response(&self) -> bool {
        self.capabilities.has(Capability::OptimizedSeederResponse)
    }
}

/// A [`TrackerResult`] plus the two HTTP response layouts.
#[derive(Debug, Default, serde::Serialize)]
pub struct HttpResult {
    pub supports_compact: bool,
    pub supports_non_compact: bool,
    #[serde(flatten)]
    pub tracker: TrackerResult,
}
