//! Core fusion processing modules

pub mod cross_track;
pub mod decompose;
pub mod gnss_ref;
pub mod grid_unify;
pub mod math;
pub mod track_merge;

// Re-export main types
pub use cross_track::{CanonicalGeometry, CrossTrackMerger, CrossTrackResult, PassAverage};
pub use decompose::{Decomposer, DecompositionMode, NorthTreatment};
pub use gnss_ref::{GnssReferencer, RefMethod, DERAMP_SIGNAL_THRESHOLD};
pub use grid_unify::{resample_reference, GridUnifier};
pub use track_merge::{MergeMethod, MergedSegment, TrackMerger};
