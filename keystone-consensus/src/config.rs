//! Engine configuration

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ticks a replica waits in view change before escalating to a higher
/// target view.
pub const DEFAULT_VIEW_CHANGE_TIMEOUT: u32 = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Ticks before a view-change escalates to the next target.
    pub view_change_timeout: u32,
    /// When false the replica validates everything but never emits
    /// prepares, commits or view-changes.
    pub bp_candidate: bool,
    /// Directory for the shutdown snapshots. Persistence is disabled when
    /// unset.
    pub data_dir: Option<PathBuf>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            view_change_timeout: DEFAULT_VIEW_CHANGE_TIMEOUT,
            bp_candidate: true,
            data_dir: None,
        }
    }
}

impl ConsensusConfig {
    /// Create a config with validation.
    pub fn new(view_change_timeout: u32, bp_candidate: bool) -> Result<Self> {
        if view_change_timeout == 0 {
            return Err(anyhow::anyhow!(
                "view_change_timeout must be at least one tick"
            ));
        }
        Ok(Self {
            view_change_timeout,
            bp_candidate,
            data_dir: None,
        })
    }

    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }
}
