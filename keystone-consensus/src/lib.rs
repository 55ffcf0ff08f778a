//! Keystone consensus - a PBFT finality layer for a block-producing chain
//!
//! Blocks progress prepared -> committed -> stable-checkpointed; a stable
//! checkpoint is irrevocable regardless of longest-chain dynamics. The
//! engine runs a single-threaded event loop over incoming messages, chain
//! notifications and timer ticks.

pub mod certificate;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod machine;
pub mod message;
pub mod network;
pub mod new_view;
pub mod persistence;
pub mod quorum;
pub mod view;
pub mod watermark;

pub use certificate::*;
pub use checkpoint::*;
pub use config::*;
pub use controller::*;
pub use engine::*;
pub use error::*;
pub use machine::*;
pub use message::*;
pub use network::*;
pub use new_view::*;
pub use persistence::*;
pub use quorum::*;
pub use view::*;
pub use watermark::*;
