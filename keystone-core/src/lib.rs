//! Keystone core - block, schedule and crypto primitives

pub mod codec;
pub mod crypto;
pub mod types;

pub use codec::*;
pub use crypto::*;
pub use types::*;
