use crate::probe::announce::ProbeContext;
use crate::probe::result::ProbeError;
use crate::types::{AnnounceRequest, Event, InfoHash, Response};

/// One deliberately broken field of an otherwise ordinary announce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Malformation {
    ShortInfoHash,
    LongInfoHash,
    ShortPeerId,
    LongPeerId,
    NegativeUploaded,
    NegativeDownloaded,
    NegativeLeft,
    InvalidEvent,
}

impl Malformation {
    pub const ALL: [Malformation; 8] = [
        Malformation::ShortInfoHash,
        Malformation::LongInfoHash,
        Malformation::ShortPeerId,
        Malformation::LongPeerId,
        Malformation::NegativeUploaded,
        Malformation::NegativeDownloaded,
        Malformation::NegativeLeft,
        Malformation::InvalidEvent,
    ];

    pub fn describe(self) -> &'static str {
        match self {
            Malformation::ShortInfoHash => "a 3-byte info_hash",
            Malformation::LongInfoHash => "a 21-byte info_hash",
            Malformation::ShortPeerId => "a 19-byte peer_id",
            Malformation::LongPeerId => "a 21-byte peer_id",
            Malformation::NegativeUploaded => "uploaded=-1",
            Malformation::NegativeDownloaded => "downloaded=-1",
            Malformation::NegativeLeft => "left=-1",
            Malformation::InvalidEvent => "event=invalid",
        }
    }

    /// Wrong-length identifiers cannot be framed in a BEP 15 announce.
    pub fn fits_fixed_layout(self) -> bool {
        !matches!(
            self,
            Malformation::ShortInfoHash
                | Malformation::LongInfoHash
                | Malformation::ShortPeerId
                | Malformation::LongPeerId
        )
    }

    pub fn apply(self, req: &mut AnnounceRequest) {
        match self {
            Malformation::ShortInfoHash => req.info_hash = InfoHash::from_bytes(&[30; 3]),
            Malformation::LongInfoHash => req.info_hash = InfoHash::from_bytes(&[30; 21]),
            Malformation::ShortPeerId => req.peer.id.truncate(19),
            Malformation::LongPeerId => req.peer.id.push(b'9'),
            Malformation::NegativeUploaded => req.uploaded = -1,
            Malformation::NegativeDownloaded => req.downloaded = -1,
            Malformation::NegativeLeft => req.left = -1,
            Malformation::InvalidEvent => req.event = Event::Invalid,
        }
    }
}

/// Passes when the tracker refuses an announce carrying `malformation`.
///
/// Only refusal is checked. A tracker that accepts the announce fails the
/// probe; what it did with the bogus values is not inspected.
pub fn rejects(ctx: &mut ProbeContext<'_>, malformation: Malformation) -> Result<(), ProbeError> {
    let info_hash = ctx.info_hash();
    let peer = ctx.peer();
    let mut req = AnnounceRequest::new(info_hash, peer);
    req.left = 100;
    malformation.apply(&mut req);

    match ctx.exchange(&req) {
        Ok(Response::Error(reason)) => {
            log::debug!("tracker refused {}: {reason}", malformation.describe());
            Ok(())
        }
        Err(e) if e.is_rejection() => {
            log::debug!("tracker refused {}: {e}", malformation.describe());
            Ok(())
        }
        Err(source) => Err(ProbeError::Transport {
            context: "malformed announce",
            source,
        }),
        Ok(Response::Warning(warning)) => Err(ProbeError::violation(format!(
            "tracker accepted an announce with {} (warning: {warning})",
            malformation.describe()
        ))),
        Ok(Response::Announce(_)) => Err(ProbeError::violation(format!(
            "tracker accepted an announce with {}",
            malformation.describe()
        ))),
    }
}
