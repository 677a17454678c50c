//! Run configuration: every selectable parameter of the fusion pipeline.
//!
//! Loading this from a file is the caller's job; the struct itself is the
//! interface. All fields have defaults so partial configurations work.

use serde::{Deserialize, Serialize};

use crate::core::decompose::{DecompositionMode, NorthTreatment};
use crate::core::gnss_ref::RefMethod;
use crate::core::track_merge::MergeMethod;

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Offset-correction function for along-track merging
    pub merge_method: MergeMethod,

    /// Reference-frame tie method
    pub ref_method: RefMethod,

    /// Polynomial order for the reference tie (1 or 2); required when
    /// `ref_method` is `Polynomial`
    pub ref_poly_order: Option<u32>,

    /// Window size for the reference-tie smoothing filter; must be odd
    pub ref_filter_window: usize,

    /// Decomposition mode
    pub decomposition_mode: DecompositionMode,

    /// Condition-number threshold for the ill-conditioned mask; 0 disables
    pub condition_threshold: f64,

    /// Parameter-variance threshold for the high-variance mask; 0 disables
    pub variance_threshold: f64,

    /// Worker threads for per-pixel decomposition; 0 disables parallelism
    pub workers: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            merge_method: MergeMethod::Mean,
            ref_method: RefMethod::None,
            ref_poly_order: None,
            ref_filter_window: 25,
            decomposition_mode: DecompositionMode::Direct(NorthTreatment::SubtractReference),
            condition_threshold: 0.0,
            variance_threshold: 0.0,
            workers: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FusionConfig::default();
        assert_eq!(config.merge_method, MergeMethod::Mean);
        assert_eq!(config.ref_method, RefMethod::None);
        assert_eq!(config.workers, 0);
    }
}
