//! velfuse: Multi-geometry LOS velocity fusion
//!
//! This library fuses satellite line-of-sight ground-velocity fields from
//! different viewing geometries into East/North/Up motion components on a
//! common grid: per-frame resampling, along-track merging of overlapping
//! frames, reference-frame tie against an external velocity field, and a
//! per-pixel weighted least-squares decomposition with conditioning and
//! uncertainty diagnostics.

pub mod config;
pub mod core;
pub mod pipeline;
pub mod types;

// Re-export main types and functions for easier access
pub use config::FusionConfig;
pub use core::{
    CrossTrackMerger, CrossTrackResult, Decomposer, DecompositionMode, GnssReferencer,
    GridUnifier, MergeMethod, NorthTreatment, RefMethod, TrackMerger,
};
pub use pipeline::{subtract_bias, FusionPipeline, FusionProducts};
pub use types::{
    CellState, DecompositionResult, Frame, FusionError, FusionResult, Grid, PassDirection,
    ReferenceField, VelImage, VelocityStack,
};
