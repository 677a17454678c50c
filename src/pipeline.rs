//! End-to-end fusion pipeline: grid unification, along-track merging, an
//! optional external bias subtraction, reference-frame tie, and the final
//! per-pixel decomposition.

use crate::config::FusionConfig;
use crate::core::cross_track::{CrossTrackMerger, CrossTrackResult};
use crate::core::decompose::Decomposer;
use crate::core::gnss_ref::{GnssReferencer, RefMethod};
use crate::core::grid_unify::{resample_reference, GridUnifier};
use crate::core::track_merge::TrackMerger;
use crate::types::{
    DecompositionResult, Frame, FusionError, FusionResult, ReferenceField, VelImage,
    VelocityStack,
};

/// Subtract an externally supplied per-pixel bias field (e.g. a plate-motion
/// correction) from each layer, one bias image per layer. Only valid cells
/// with a finite bias are touched.
pub fn subtract_bias(stack: &mut VelocityStack, bias: &[VelImage]) -> FusionResult<()> {
    if bias.len() != stack.n_layers() {
        return Err(FusionError::InvalidData(format!(
            "Got {} bias fields for {} layers",
            bias.len(),
            stack.n_layers()
        )));
    }
    let (rows, cols) = stack.grid.shape();
    for (l, field) in bias.iter().enumerate() {
        if field.dim() != (rows, cols) {
            return Err(FusionError::InvalidData(format!(
                "Bias field {} is not on the common grid",
                l
            )));
        }
        for r in 0..rows {
            for c in 0..cols {
                let b = field[[r, c]];
                if stack.is_valid(l, r, c) && b.is_finite() {
                    stack.vel[[l, r, c]] -= b;
                }
            }
        }
    }
    log::info!("Subtracted external bias from {} layers", bias.len());
    Ok(())
}

/// Products of a full pipeline run
pub struct FusionProducts {
    /// Per-pixel East/North/Up decomposition of the fused stack
    pub decomposition: DecompositionResult,
    /// Correction surface subtracted from each merged layer by the
    /// reference tie, kept as a diagnostic; `None` when no tie ran
    pub correction_surfaces: Option<Vec<VelImage>>,
}

/// Fusion pipeline driver
pub struct FusionPipeline {
    config: FusionConfig,
}

impl FusionPipeline {
    pub fn new(config: FusionConfig) -> Self {
        FusionPipeline { config }
    }

    /// Unify the input frames onto the common grid and merge them along
    /// track. The returned stack is the merged per-track product.
    pub fn unify_and_merge(&self, frames: &[Frame]) -> FusionResult<VelocityStack> {
        let stack = GridUnifier::new().unify(frames)?;
        TrackMerger::new(self.config.merge_method).merge(&stack)
    }

    /// Run the full pipeline. `bias` (one field per merged layer, on the
    /// common grid) is subtracted between merging and referencing when
    /// supplied.
    pub fn run(
        &self,
        frames: &[Frame],
        reference: Option<&ReferenceField>,
        bias: Option<&[VelImage]>,
    ) -> FusionResult<FusionProducts> {
        let mut merged = self.unify_and_merge(frames)?;

        if let Some(bias) = bias {
            subtract_bias(&mut merged, bias)?;
        }

        let gridded_reference = reference.map(|field| resample_reference(field, &merged.grid));

        let correction_surfaces = if self.config.ref_method != RefMethod::None {
            let gridded = gridded_reference.as_ref().ok_or_else(|| {
                FusionError::Configuration(
                    "Reference tie selected but no reference field supplied".to_string(),
                )
            })?;
            let referencer = GnssReferencer::new(
                self.config.ref_method,
                self.config.ref_poly_order,
                self.config.ref_filter_window,
            )?;
            Some(referencer.apply(&mut merged, gridded)?)
        } else {
            None
        };

        let decomposition = Decomposer::new(self.config.decomposition_mode)
            .with_thresholds(
                self.config.condition_threshold,
                self.config.variance_threshold,
            )
            .with_workers(self.config.workers)
            .decompose(&merged, gridded_reference.as_ref())?;

        Ok(FusionProducts {
            decomposition,
            correction_surfaces,
        })
    }

    /// Diagnostic across-track merge of an already along-track-merged
    /// stack; its output never feeds the decomposer.
    pub fn cross_track_diagnostic(&self, merged: &VelocityStack) -> FusionResult<CrossTrackResult> {
        CrossTrackMerger::new().merge(merged)
    }
}
