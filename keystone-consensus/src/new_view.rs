//! NewView validation
//!
//! An incoming NewView is accepted only when every clause below holds; a
//! failing clause rejects the whole message with a typed error and leaves
//! local state untouched. The replacement primary cannot invent evidence:
//! the prepared/committed/stable fields must equal what this validator
//! reconstructs from the view-changes the certificate itself carries.

use crate::certificate::{
    is_valid_committed_certificate, is_valid_prepared_certificate, is_valid_view_change,
};
use crate::checkpoint::CheckpointAccumulator;
use crate::error::NewViewError;
use crate::message::{
    CommittedCertificate, NewView, PreparedCertificate, StableCheckpoint, ViewChange,
};
use crate::view::ViewAccumulator;
use keystone_chain::ChainAdapter;
use keystone_core::CanonicalEncode;
use std::collections::BTreeMap;

/// The union of prepared / committed / stable evidence across a set of
/// view-changes, selected deterministically so that the primary and every
/// validator arrive at identical fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpectedEvidence {
    pub prepared: Option<PreparedCertificate>,
    pub committed: Vec<CommittedCertificate>,
    pub stable_checkpoint: Option<StableCheckpoint>,
}

/// Rebuild the evidence a NewView for these view-changes must carry.
///
/// Prepared: the individually-valid certificate with the highest block.
/// Committed: one valid certificate per distinct block id. Stable: the
/// highest-block valid stable checkpoint. Ties break on the canonical
/// encoding so the selection is total.
pub fn reconstruct_evidence(
    chain: &dyn ChainAdapter,
    view_changes: &[ViewChange],
) -> ExpectedEvidence {
    let mut prepared: Option<PreparedCertificate> = None;
    for vc in view_changes {
        let Some(cert) = &vc.prepared_cert else { continue };
        if !is_valid_prepared_certificate(cert, chain) {
            continue;
        }
        let better = match &prepared {
            None => true,
            Some(best) => {
                (cert.block_num(), cert.block_id, cert.encoded())
                    > (best.block_num(), best.block_id, best.encoded())
            }
        };
        if better {
            prepared = Some(cert.clone());
        }
    }

    let mut committed: BTreeMap<_, CommittedCertificate> = BTreeMap::new();
    for vc in view_changes {
        for cert in &vc.committed_certs {
            if !is_valid_committed_certificate(cert, chain) {
                continue;
            }
            let entry = committed.entry(cert.block_id);
            match entry {
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(cert.clone());
                }
                std::collections::btree_map::Entry::Occupied(mut slot) => {
                    if cert.encoded() > slot.get().encoded() {
                        slot.insert(cert.clone());
                    }
                }
            }
        }
    }
    // highest block first; block ids order by their number prefix
    let committed: Vec<CommittedCertificate> = committed.into_values().rev().collect();

    let mut stable: Option<StableCheckpoint> = None;
    for vc in view_changes {
        let Some(scp) = &vc.stable_checkpoint else { continue };
        if !CheckpointAccumulator::is_valid_stable_checkpoint(scp, chain) {
            continue;
        }
        let better = match &stable {
            None => true,
            Some(best) => {
                (scp.block_num(), scp.block_id, scp.encoded())
                    > (best.block_num(), best.block_id, best.encoded())
            }
        };
        if better {
            stable = Some(scp.clone());
        }
    }

    ExpectedEvidence {
        prepared,
        committed,
        stable_checkpoint: stable,
    }
}

/// Validates NewView messages against the local view accumulator and the
/// chain's LSCB schedule.
pub struct NewViewValidator<'a> {
    pub chain: &'a dyn ChainAdapter,
    pub views: &'a ViewAccumulator,
}

impl NewViewValidator<'_> {
    pub fn validate(&self, nv: &NewView) -> Result<(), NewViewError> {
        let schedule = self.chain.lscb_active_producers();

        // 1. signed by the expected primary of the target view
        match schedule.primary_for(nv.view) {
            Some(primary) if primary == nv.public_key => {}
            _ => {
                return Err(NewViewError::WrongPrimary {
                    view: nv.view,
                    got: nv.public_key,
                })
            }
        }
        if !nv.verify_signature(&self.chain.chain_id()) {
            return Err(NewViewError::BadSignature);
        }

        // 2. the certificate targets the same view
        if nv.view_changed_cert.view != nv.view {
            return Err(NewViewError::CertificateViewMismatch {
                expected: nv.view,
                got: nv.view_changed_cert.view,
            });
        }

        // 3. every contained view-change is individually valid and votes
        //    for this exact view
        for vc in &nv.view_changed_cert.view_changes {
            if vc.target_view() != nv.view || !is_valid_view_change(vc, self.chain) {
                return Err(NewViewError::InvalidViewChange);
            }
        }

        // 4. quorum by schedule membership, not by raw count
        let members = nv
            .view_changed_cert
            .signers()
            .into_iter()
            .filter(|key| schedule.contains(key))
            .count();
        if members < schedule.quorum_threshold() {
            return Err(NewViewError::InsufficientQuorum {
                have: members,
                need: schedule.quorum_threshold(),
            });
        }

        // 5. our own accumulator agrees this view is ready
        if !self.views.should_new_view(nv.view) {
            return Err(NewViewError::NotReadyLocally(nv.view));
        }

        // 6/7. the carried evidence equals the reconstruction
        let expected = reconstruct_evidence(self.chain, &nv.view_changed_cert.view_changes);
        if nv.prepared_cert != expected.prepared {
            return Err(NewViewError::PreparedCertMismatch);
        }
        let mut got = nv.committed_certs.clone();
        got.sort_by(|a, b| b.block_id.cmp(&a.block_id));
        if got != expected.committed {
            return Err(NewViewError::CommittedCertsMismatch);
        }
        if nv.stable_checkpoint != expected.stable_checkpoint {
            return Err(NewViewError::StableCheckpointMismatch);
        }
        Ok(())
    }
}
