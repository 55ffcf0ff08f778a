//! Error taxonomy
//!
//! Validation failures are typed results returned inward; the engine never
//! surfaces them to the network, so a Byzantine sender cannot distinguish
//! a cryptographic rejection from a staleness drop. Only invariant
//! violations abort.

use keystone_core::{CodecError, PublicKey, ViewNum};
use thiserror::Error;

/// Why an incoming vote (prepare, commit, checkpoint, view-change) was
/// dropped. All variants are dropped silently and counted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoteError {
    /// Bad signature, bad digest or inconsistent fields.
    #[error("malformed: {0}")]
    Malformed(&'static str),
    /// At or below the last stable checkpoint, a duplicate tuple, or a
    /// view target already behind us.
    #[error("stale")]
    Stale,
    /// Signer is not a member of the relevant active producer schedule.
    #[error("signer out of schedule")]
    OutOfSchedule,
    /// The referenced block is not (yet) known to this node.
    #[error("unknown block")]
    UnknownBlock,
}

impl VoteError {
    /// Label used for the drop counters.
    pub fn metric_label(&self) -> &'static str {
        match self {
            VoteError::Malformed(_) => "malformed",
            VoteError::Stale => "stale",
            VoteError::OutOfSchedule => "out_of_schedule",
            VoteError::UnknownBlock => "unknown_block",
        }
    }
}

/// Why a NewView was rejected, one variant per validation clause. The
/// replica stays in view change and touches no local state on rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NewViewError {
    #[error("new-view signature invalid")]
    BadSignature,
    #[error("new-view for view {view} signed by {got}, not the expected primary")]
    WrongPrimary { view: ViewNum, got: PublicKey },
    #[error("view-changed certificate targets view {got}, new-view says {expected}")]
    CertificateViewMismatch { expected: ViewNum, got: ViewNum },
    #[error("view-changed certificate contains an invalid view-change")]
    InvalidViewChange,
    #[error("view-change quorum has {have} schedule members, needs {need}")]
    InsufficientQuorum { have: usize, need: usize },
    #[error("local accumulator does not agree view {0} is ready")]
    NotReadyLocally(ViewNum),
    #[error("prepared certificate does not match the view-change evidence")]
    PreparedCertMismatch,
    #[error("committed certificates do not match the view-change evidence")]
    CommittedCertsMismatch,
    #[error("stable checkpoint does not match the view-change evidence")]
    StableCheckpointMismatch,
}

/// Snapshot load/store failures. Never fatal: an unreadable snapshot
/// degrades to an empty accumulator rebuilt from the chain.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot decode: {0}")]
    Codec(#[from] CodecError),
}
