//! Network stream pairs
//!
//! Five incoming/outgoing channel pairs, one per message kind. The engine
//! consumes the incoming ends and publishes to the outgoing ends; the
//! transport (gossip, relay, test harness) holds the peer half. Delivery
//! may be lossy, duplicating and out-of-order; the accumulators tolerate
//! all three.

use crate::message::{Checkpoint, Commit, NewView, Prepare, ViewChange};
use tokio::sync::mpsc;

/// Engine-side stream ends.
pub struct NetworkHandles {
    pub prepare_in: mpsc::Receiver<Prepare>,
    pub prepare_out: mpsc::Sender<Prepare>,
    pub commit_in: mpsc::Receiver<Commit>,
    pub commit_out: mpsc::Sender<Commit>,
    pub view_change_in: mpsc::Receiver<ViewChange>,
    pub view_change_out: mpsc::Sender<ViewChange>,
    pub new_view_in: mpsc::Receiver<NewView>,
    pub new_view_out: mpsc::Sender<NewView>,
    pub checkpoint_in: mpsc::Receiver<Checkpoint>,
    pub checkpoint_out: mpsc::Sender<Checkpoint>,
}

/// Transport-side stream ends.
pub struct NetworkPeer {
    pub prepare_in: mpsc::Sender<Prepare>,
    pub prepare_out: mpsc::Receiver<Prepare>,
    pub commit_in: mpsc::Sender<Commit>,
    pub commit_out: mpsc::Receiver<Commit>,
    pub view_change_in: mpsc::Sender<ViewChange>,
    pub view_change_out: mpsc::Receiver<ViewChange>,
    pub new_view_in: mpsc::Sender<NewView>,
    pub new_view_out: mpsc::Receiver<NewView>,
    pub checkpoint_in: mpsc::Sender<Checkpoint>,
    pub checkpoint_out: mpsc::Receiver<Checkpoint>,
}

impl NetworkHandles {
    /// Build both halves with bounded channels.
    pub fn bounded(capacity: usize) -> (NetworkHandles, NetworkPeer) {
        let (prepare_in_tx, prepare_in_rx) = mpsc::channel(capacity);
        let (prepare_out_tx, prepare_out_rx) = mpsc::channel(capacity);
        let (commit_in_tx, commit_in_rx) = mpsc::channel(capacity);
        let (commit_out_tx, commit_out_rx) = mpsc::channel(capacity);
        let (view_change_in_tx, view_change_in_rx) = mpsc::channel(capacity);
        let (view_change_out_tx, view_change_out_rx) = mpsc::channel(capacity);
        let (new_view_in_tx, new_view_in_rx) = mpsc::channel(capacity);
        let (new_view_out_tx, new_view_out_rx) = mpsc::channel(capacity);
        let (checkpoint_in_tx, checkpoint_in_rx) = mpsc::channel(capacity);
        let (checkpoint_out_tx, checkpoint_out_rx) = mpsc::channel(capacity);

        let handles = NetworkHandles {
            prepare_in: prepare_in_rx,
            prepare_out: prepare_out_tx,
            commit_in: commit_in_rx,
            commit_out: commit_out_tx,
            view_change_in: view_change_in_rx,
            view_change_out: view_change_out_tx,
            new_view_in: new_view_in_rx,
            new_view_out: new_view_out_tx,
            checkpoint_in: checkpoint_in_rx,
            checkpoint_out: checkpoint_out_tx,
        };
        let peer = NetworkPeer {
            prepare_in: prepare_in_tx,
            prepare_out: prepare_out_rx,
            commit_in: commit_in_tx,
            commit_out: commit_out_rx,
            view_change_in: view_change_in_tx,
            view_change_out: view_change_out_rx,
            new_view_in: new_view_in_tx,
            new_view_out: new_view_out_rx,
            checkpoint_in: checkpoint_in_tx,
            checkpoint_out: checkpoint_out_rx,
        };
        (handles, peer)
    }
}
