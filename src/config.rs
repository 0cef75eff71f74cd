//! Run settings.
//!
//! Every field has a default, so a settings file only needs the keys it
//! changes:
//!
//! ```json
//! { "threads": 4, "prune": "transfer", "mono": true }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::model::Barline;

/// How overlapping events in one voice are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrunePolicy {
    /// Shorten the earlier event
    #[default]
    Cutoff,
    /// Shorten the later event from its start
    Steal,
    /// Cut the earlier event around the later one
    Split,
    /// Shorten the earlier event and lengthen the later one by the same amount
    Transfer,
}

/// Settings for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Worker threads per stage: 1 runs on the caller's thread, 0 uses one
    /// per CPU
    pub threads: usize,
    /// Overlap resolution policy
    pub prune: PrunePolicy,
    /// Prune every overlap in a voice, not only unisons
    pub mono: bool,
    /// Quantization grid, in steps per quarter note
    pub quantize_divisions: u32,
    /// Barline drawn after the last measure when none is requested
    pub final_barline: Barline,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threads: 1,
            prune: PrunePolicy::Cutoff,
            mono: false,
            quantize_divisions: 8,
            final_barline: Barline::Final,
        }
    }
}

impl Settings {
    /// Parse settings from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read settings from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Whether stages should fan out to a worker pool.
    pub fn is_parallel(&self) -> bool {
        self.threads != 1
    }
}
