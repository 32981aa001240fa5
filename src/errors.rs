//! Error kinds surfaced by the overlay core.
//!
//! Transient routing failures are absorbed by the outbound queue and
//! never reach callers as errors; the kinds here are the structural
//! violations and content failures the embedding layer may match on.

use thiserror::Error;

use crate::media::PartStatus;
use crate::messages::PeerId;

#[derive(Debug, Error)]
pub enum SwarmError {
    /// A message failed schema validation and was not sent.
    #[error("invalid message: missing or empty `{0}`")]
    InvalidMessage(&'static str),

    /// No route, no neighbors, and no rendezvous available.
    #[error("no route to {0}")]
    UnknownDestination(PeerId),

    /// An `answer` arrived for a session that is not connecting.
    #[error("answer for peer {0} with no connecting session")]
    HandshakeMismatch(PeerId),

    /// An `append` targeted a part whose status is not pending.
    #[error("part {number} is {status:?}, expected pending")]
    UnexpectedPart { number: usize, status: PartStatus },

    /// Computed content digest differs from the segment index entry.
    #[error("digest mismatch for part {0}")]
    DigestMismatch(usize),

    /// A transport operation reported failure.
    #[error("transport failure: {0}")]
    TransportFailure(String),
}
