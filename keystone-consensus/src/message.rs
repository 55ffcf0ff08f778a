//! PBFT message set
//!
//! The five protocol messages (Prepare, Commit, Checkpoint, ViewChange,
//! NewView) and the evidence aggregates built from them. Every signed
//! message carries the `{timestamp, public_key, signature}` envelope; the
//! signature covers the BLAKE3 digest of the canonical serialization of
//! all other fields, domain-separated per kind and bound to the chain id.

use chrono::Utc;
use keystone_core::{
    decode_seq, encode_seq, CanonicalDecode, CanonicalEncode, CodecError, SignatureProvider,
};
use keystone_core::{crypto, BlockId, BlockNum, ChainId, PublicKey, ViewNum};
use serde::{Deserialize, Serialize};

/// Envelope timestamp: microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/// Message kind tags, used for log and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Prepare,
    Commit,
    ViewChange,
    NewView,
    Checkpoint,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Prepare => "prepare",
            MessageKind::Commit => "commit",
            MessageKind::ViewChange => "view_change",
            MessageKind::NewView => "new_view",
            MessageKind::Checkpoint => "checkpoint",
        }
    }
}

fn signing_digest(domain: &[u8], chain_id: &ChainId, unsigned: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(32 + unsigned.len());
    buf.extend_from_slice(&chain_id.0);
    buf.extend_from_slice(unsigned);
    crypto::hash_with_prefix(domain, &buf)
}

/// A prepare vote for a block in a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: ViewNum,
    pub block_id: BlockId,
    pub block_num: BlockNum,
    pub timestamp: u64,
    pub public_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// A commit vote for a block in a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: ViewNum,
    pub block_id: BlockId,
    pub block_num: BlockNum,
    pub timestamp: u64,
    pub public_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// A checkpoint vote for a block. View-independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub block_id: BlockId,
    pub block_num: BlockNum,
    pub timestamp: u64,
    pub public_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Quorum of prepares for one block in one view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PreparedCertificate {
    pub block_id: BlockId,
    pub prepares: Vec<Prepare>,
}

/// Quorum of commits for one block in one view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommittedCertificate {
    pub block_id: BlockId,
    pub commits: Vec<Commit>,
}

/// Quorum of checkpoints pinning a block forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StableCheckpoint {
    pub block_id: BlockId,
    pub checkpoints: Vec<Checkpoint>,
}

/// A vote to abandon `current_view`, carrying the sender's best evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub current_view: ViewNum,
    pub prepared_cert: Option<PreparedCertificate>,
    pub committed_certs: Vec<CommittedCertificate>,
    pub stable_checkpoint: Option<StableCheckpoint>,
    pub timestamp: u64,
    pub public_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl ViewChange {
    /// The view this message votes to enter.
    pub fn target_view(&self) -> ViewNum {
        self.current_view + 1
    }
}

/// Quorum of view-changes establishing readiness of a target view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ViewChangedCertificate {
    pub view: ViewNum,
    pub view_changes: Vec<ViewChange>,
}

/// The replacement primary's proposal for its new view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub view: ViewNum,
    pub prepared_cert: Option<PreparedCertificate>,
    pub committed_certs: Vec<CommittedCertificate>,
    pub stable_checkpoint: Option<StableCheckpoint>,
    pub view_changed_cert: ViewChangedCertificate,
    pub timestamp: u64,
    pub public_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

macro_rules! impl_signed_vote {
    ($ty:ident, $domain:literal) => {
        impl $ty {
            pub const DOMAIN: &'static [u8] = $domain;

            fn encode_unsigned(&self, out: &mut Vec<u8>) {
                self.view.encode(out);
                self.block_id.encode(out);
                self.block_num.encode(out);
                self.timestamp.encode(out);
                self.public_key.encode(out);
            }

            /// Digest of all fields except the signature.
            pub fn digest(&self, chain_id: &ChainId) -> [u8; 32] {
                let mut buf = Vec::new();
                self.encode_unsigned(&mut buf);
                signing_digest(Self::DOMAIN, chain_id, &buf)
            }

            pub fn verify_signature(&self, chain_id: &ChainId) -> bool {
                crypto::verify(&self.public_key, &self.digest(chain_id), &self.signature)
            }

            /// Build and sign a fresh vote for `block_id`.
            pub fn signed(
                view: ViewNum,
                block_id: BlockId,
                chain_id: &ChainId,
                provider: &dyn SignatureProvider,
            ) -> Self {
                let mut msg = Self {
                    view,
                    block_id,
                    block_num: block_id.block_num(),
                    timestamp: now_micros(),
                    public_key: provider.public_key(),
                    signature: Vec::new(),
                };
                msg.signature = provider.sign(&msg.digest(chain_id)).to_vec();
                msg
            }

            /// Same vote, fresh timestamp and signature, for re-emission.
            pub fn resigned(
                &self,
                chain_id: &ChainId,
                provider: &dyn SignatureProvider,
            ) -> Self {
                Self::signed(self.view, self.block_id, chain_id, provider)
            }
        }

        impl CanonicalEncode for $ty {
            fn encode(&self, out: &mut Vec<u8>) {
                self.encode_unsigned(out);
                self.signature.encode(out);
            }
        }

        impl CanonicalDecode for $ty {
            fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
                Ok(Self {
                    view: ViewNum::decode(input)?,
                    block_id: BlockId::decode(input)?,
                    block_num: BlockNum::decode(input)?,
                    timestamp: u64::decode(input)?,
                    public_key: PublicKey::decode(input)?,
                    signature: Vec::<u8>::decode(input)?,
                })
            }
        }
    };
}

impl_signed_vote!(Prepare, b"keystone.prepare");
impl_signed_vote!(Commit, b"keystone.commit");

impl Checkpoint {
    pub const DOMAIN: &'static [u8] = b"keystone.checkpoint";

    fn encode_unsigned(&self, out: &mut Vec<u8>) {
        self.block_id.encode(out);
        self.block_num.encode(out);
        self.timestamp.encode(out);
        self.public_key.encode(out);
    }

    pub fn digest(&self, chain_id: &ChainId) -> [u8; 32] {
        let mut buf = Vec::new();
        self.encode_unsigned(&mut buf);
        signing_digest(Self::DOMAIN, chain_id, &buf)
    }

    pub fn verify_signature(&self, chain_id: &ChainId) -> bool {
        crypto::verify(&self.public_key, &self.digest(chain_id), &self.signature)
    }

    pub fn signed(block_id: BlockId, chain_id: &ChainId, provider: &dyn SignatureProvider) -> Self {
        let mut msg = Self {
            block_id,
            block_num: block_id.block_num(),
            timestamp: now_micros(),
            public_key: provider.public_key(),
            signature: Vec::new(),
        };
        msg.signature = provider.sign(&msg.digest(chain_id)).to_vec();
        msg
    }
}

impl CanonicalEncode for Checkpoint {
    fn encode(&self, out: &mut Vec<u8>) {
        self.encode_unsigned(out);
        self.signature.encode(out);
    }
}

impl CanonicalDecode for Checkpoint {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            block_id: BlockId::decode(input)?,
            block_num: BlockNum::decode(input)?,
            timestamp: u64::decode(input)?,
            public_key: PublicKey::decode(input)?,
            signature: Vec::<u8>::decode(input)?,
        })
    }
}

macro_rules! impl_block_certificate {
    ($ty:ident, $field:ident, $member:ty) => {
        impl $ty {
            pub fn block_num(&self) -> BlockNum {
                self.block_id.block_num()
            }

            pub fn is_empty(&self) -> bool {
                self.$field.is_empty()
            }

            pub fn signers(&self) -> Vec<PublicKey> {
                let mut keys: Vec<PublicKey> = self.$field.iter().map(|m| m.public_key).collect();
                keys.sort();
                keys.dedup();
                keys
            }
        }

        impl CanonicalEncode for $ty {
            fn encode(&self, out: &mut Vec<u8>) {
                self.block_id.encode(out);
                encode_seq(&self.$field, out);
            }
        }

        impl CanonicalDecode for $ty {
            fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
                Ok(Self {
                    block_id: BlockId::decode(input)?,
                    $field: decode_seq::<$member>(input)?,
                })
            }
        }
    };
}

impl_block_certificate!(PreparedCertificate, prepares, Prepare);
impl_block_certificate!(CommittedCertificate, commits, Commit);
impl_block_certificate!(StableCheckpoint, checkpoints, Checkpoint);

impl CanonicalEncode for ViewChangedCertificate {
    fn encode(&self, out: &mut Vec<u8>) {
        self.view.encode(out);
        encode_seq(&self.view_changes, out);
    }
}

impl CanonicalDecode for ViewChangedCertificate {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            view: ViewNum::decode(input)?,
            view_changes: decode_seq::<ViewChange>(input)?,
        })
    }
}

impl ViewChangedCertificate {
    pub fn signers(&self) -> Vec<PublicKey> {
        let mut keys: Vec<PublicKey> = self.view_changes.iter().map(|vc| vc.public_key).collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

impl ViewChange {
    pub const DOMAIN: &'static [u8] = b"keystone.view_change";

    fn encode_unsigned(&self, out: &mut Vec<u8>) {
        self.current_view.encode(out);
        self.prepared_cert.encode(out);
        encode_seq(&self.committed_certs, out);
        self.stable_checkpoint.encode(out);
        self.timestamp.encode(out);
        self.public_key.encode(out);
    }

    pub fn digest(&self, chain_id: &ChainId) -> [u8; 32] {
        let mut buf = Vec::new();
        self.encode_unsigned(&mut buf);
        signing_digest(Self::DOMAIN, chain_id, &buf)
    }

    pub fn verify_signature(&self, chain_id: &ChainId) -> bool {
        crypto::verify(&self.public_key, &self.digest(chain_id), &self.signature)
    }

    /// Build and sign a view-change abandoning `current_view`.
    pub fn signed(
        current_view: ViewNum,
        prepared_cert: Option<PreparedCertificate>,
        committed_certs: Vec<CommittedCertificate>,
        stable_checkpoint: Option<StableCheckpoint>,
        chain_id: &ChainId,
        provider: &dyn SignatureProvider,
    ) -> Self {
        let mut msg = Self {
            current_view,
            prepared_cert,
            committed_certs,
            stable_checkpoint,
            timestamp: now_micros(),
            public_key: provider.public_key(),
            signature: Vec::new(),
        };
        msg.signature = provider.sign(&msg.digest(chain_id)).to_vec();
        msg
    }

    /// Same evidence, fresh timestamp and signature, for re-emission.
    pub fn resigned(&self, chain_id: &ChainId, provider: &dyn SignatureProvider) -> Self {
        Self::signed(
            self.current_view,
            self.prepared_cert.clone(),
            self.committed_certs.clone(),
            self.stable_checkpoint.clone(),
            chain_id,
            provider,
        )
    }
}

impl CanonicalEncode for ViewChange {
    fn encode(&self, out: &mut Vec<u8>) {
        self.encode_unsigned(out);
        self.signature.encode(out);
    }
}

impl CanonicalDecode for ViewChange {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            current_view: ViewNum::decode(input)?,
            prepared_cert: Option::<PreparedCertificate>::decode(input)?,
            committed_certs: decode_seq::<CommittedCertificate>(input)?,
            stable_checkpoint: Option::<StableCheckpoint>::decode(input)?,
            timestamp: u64::decode(input)?,
            public_key: PublicKey::decode(input)?,
            signature: Vec::<u8>::decode(input)?,
        })
    }
}

impl NewView {
    pub const DOMAIN: &'static [u8] = b"keystone.new_view";

    fn encode_unsigned(&self, out: &mut Vec<u8>) {
        self.view.encode(out);
        self.prepared_cert.encode(out);
        encode_seq(&self.committed_certs, out);
        self.stable_checkpoint.encode(out);
        self.view_changed_cert.encode(out);
        self.timestamp.encode(out);
        self.public_key.encode(out);
    }

    pub fn digest(&self, chain_id: &ChainId) -> [u8; 32] {
        let mut buf = Vec::new();
        self.encode_unsigned(&mut buf);
        signing_digest(Self::DOMAIN, chain_id, &buf)
    }

    pub fn verify_signature(&self, chain_id: &ChainId) -> bool {
        crypto::verify(&self.public_key, &self.digest(chain_id), &self.signature)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn signed(
        view: ViewNum,
        prepared_cert: Option<PreparedCertificate>,
        committed_certs: Vec<CommittedCertificate>,
        stable_checkpoint: Option<StableCheckpoint>,
        view_changed_cert: ViewChangedCertificate,
        chain_id: &ChainId,
        provider: &dyn SignatureProvider,
    ) -> Self {
        let mut msg = Self {
            view,
            prepared_cert,
            committed_certs,
            stable_checkpoint,
            view_changed_cert,
            timestamp: now_micros(),
            public_key: provider.public_key(),
            signature: Vec::new(),
        };
        msg.signature = provider.sign(&msg.digest(chain_id)).to_vec();
        msg
    }
}

impl CanonicalEncode for NewView {
    fn encode(&self, out: &mut Vec<u8>) {
        self.encode_unsigned(out);
        self.signature.encode(out);
    }
}

impl CanonicalDecode for NewView {
    fn decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            view: ViewNum::decode(input)?,
            prepared_cert: Option::<PreparedCertificate>::decode(input)?,
            committed_certs: decode_seq::<CommittedCertificate>(input)?,
            stable_checkpoint: Option::<StableCheckpoint>::decode(input)?,
            view_changed_cert: ViewChangedCertificate::decode(input)?,
            timestamp: u64::decode(input)?,
            public_key: PublicKey::decode(input)?,
            signature: Vec::<u8>::decode(input)?,
        })
    }
}
