//! Along-track merging: stitches sequential overlapping frames of one track
//! into continuous profiles. Pairwise offset corrections compound along the
//! chain; tracks without overlap between adjacent frames split into
//! independent segments.

use crate::core::math::{nanmean, nanmedian, nanmode_rounded, ols_fit};
use crate::types::{
    parse_track_id, FusionResult, PassDirection, VelImage, VelocityStack,
};
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Offset-correction function applied to the later frame of each
/// overlapping pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    /// Subtract the scalar mean of the overlap residual
    Mean,
    /// Subtract the median of the overlap residual
    Median,
    /// Subtract the mode of the residual rounded to one decimal
    Mode,
    /// Fit and subtract a first-order planar ramp over the overlap
    PlanarRamp,
}

/// One merged output layer: a whole track, or one segment of a split track
#[derive(Debug, Clone)]
pub struct MergedSegment {
    pub track: String,
    pub segment: usize,
    /// Stack layer indices of the member frames, in along-track order
    pub members: Vec<usize>,
}

/// Along-track merge processor
pub struct TrackMerger {
    method: MergeMethod,
}

impl TrackMerger {
    pub fn new(method: MergeMethod) -> Self {
        TrackMerger { method }
    }

    /// Merge all frames of the stack track by track.
    ///
    /// Returns a new stack with one layer per track-or-segment; split
    /// tracks get a `_<segment>` id suffix. Merging a stack of already
    /// merged single-segment tracks is a no-op.
    pub fn merge(&self, stack: &VelocityStack) -> FusionResult<VelocityStack> {
        log::info!(
            "Along-track merge of {} layers ({:?} correction)",
            stack.n_layers(),
            self.method
        );

        let tracks = self.group_by_track(stack)?;
        let mut segments: Vec<(MergedSegment, PassDirection, Vec<VelImage>)> = Vec::new();

        for (track, mut layer_indices) in tracks {
            let pass = stack.passes[layer_indices[0]];
            self.order_along_track(stack, &mut layer_indices, pass);

            let track_segments = self.correct_offsets(stack, &track, &layer_indices);
            let n_segments = track_segments.len();
            if n_segments > 1 {
                log::warn!(
                    "Track {} split into {} segments (missing overlap)",
                    track,
                    n_segments
                );
            }
            for (seg, corrected) in track_segments {
                segments.push((seg, pass, corrected));
            }
        }

        let mut merged = VelocityStack::zeros(stack.grid.clone(), segments.len());
        let split_tracks: Vec<String> = segments
            .iter()
            .map(|(seg, _, _)| seg.track.clone())
            .collect();
        for (l, (seg, pass, corrected)) in segments.into_iter().enumerate() {
            let n_track_segments = split_tracks
                .iter()
                .filter(|t| **t == seg.track)
                .count();
            let id = if n_track_segments > 1 {
                format!("{}_{}", seg.track, seg.segment + 1)
            } else {
                seg.track.clone()
            };
            merged.ids.push(id);
            merged.passes.push(pass);
            self.stack_segment(stack, &seg, &corrected, &mut merged, l);
        }

        log::info!(
            "Along-track merge complete: {} track/segment layers",
            merged.n_layers()
        );
        Ok(merged)
    }

    /// Group stack layers by track identifier (deterministic order)
    fn group_by_track(&self, stack: &VelocityStack) -> FusionResult<BTreeMap<String, Vec<usize>>> {
        let mut tracks: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (l, id) in stack.ids.iter().enumerate() {
            let (track, _) = parse_track_id(id)?;
            tracks.entry(track).or_default().push(l);
        }
        Ok(tracks)
    }

    /// Order frames by the center of their valid data along the track axis:
    /// ascending passes south to north, descending passes north to south
    fn order_along_track(
        &self,
        stack: &VelocityStack,
        layer_indices: &mut [usize],
        pass: PassDirection,
    ) {
        let centers: Vec<(usize, f64)> = layer_indices
            .iter()
            .map(|&l| (l, self.valid_center_y(stack, l)))
            .collect();
        let mut ordered = centers;
        ordered.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if pass == PassDirection::Descending {
            ordered.reverse();
        }
        for (slot, (l, _)) in layer_indices.iter_mut().zip(ordered) {
            *slot = l;
        }
    }

    fn valid_center_y(&self, stack: &VelocityStack, layer: usize) -> f64 {
        let (_, rows, cols) = stack.vel.dim();
        let mut sum = 0.0;
        let mut count = 0usize;
        for r in 0..rows {
            for c in 0..cols {
                if stack.is_valid(layer, r, c) {
                    sum += stack.grid.y[r];
                    count += 1;
                }
            }
        }
        if count > 0 {
            sum / count as f64
        } else {
            f64::NAN
        }
    }

    /// Resolve pairwise offsets along the chain; a missing overlap starts a
    /// new segment. Returns per segment the member indices and their
    /// corrected velocity layers.
    fn correct_offsets(
        &self,
        stack: &VelocityStack,
        track: &str,
        ordered: &[usize],
    ) -> Vec<(MergedSegment, Vec<VelImage>)> {
        // Fold over adjacent pairs into an explicit segment list
        let mut segments: Vec<(Vec<usize>, Vec<VelImage>)> = Vec::new();
        for &layer in ordered {
            let mut vel = stack.vel.index_axis(Axis(0), layer).to_owned();
            let pair = segments.last().map(|(members, corrected)| {
                let prev_layer = *members.last().unwrap();
                (
                    prev_layer,
                    self.pair_correction(stack, prev_layer, corrected.last().unwrap(), layer, &vel),
                )
            });
            match pair {
                Some((_, Some(correction))) => {
                    apply_correction(&mut vel, &correction);
                    let last = segments.last_mut().unwrap();
                    last.0.push(layer);
                    last.1.push(vel);
                }
                Some((prev_layer, None)) => {
                    log::warn!(
                        "Track {}: no overlap between '{}' and '{}', starting new segment",
                        track,
                        stack.ids[prev_layer],
                        stack.ids[layer]
                    );
                    segments.push((vec![layer], vec![vel]));
                }
                None => segments.push((vec![layer], vec![vel])),
            }
        }

        segments
            .into_iter()
            .enumerate()
            .map(|(k, (members, corrected))| {
                (
                    MergedSegment {
                        track: track.to_string(),
                        segment: k,
                        members,
                    },
                    corrected,
                )
            })
            .collect()
    }

    /// Correction field for the later frame, from the overlap residual
    /// (later minus earlier). None when the overlap is empty.
    fn pair_correction(
        &self,
        stack: &VelocityStack,
        prev_layer: usize,
        prev_vel: &VelImage,
        next_layer: usize,
        next_vel: &VelImage,
    ) -> Option<Correction> {
        let (rows, cols) = prev_vel.dim();
        let mut residuals = Vec::new();
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                let prev_ok =
                    stack.footprint[[prev_layer, r, c]] && prev_vel[[r, c]].is_finite();
                let next_ok =
                    stack.footprint[[next_layer, r, c]] && next_vel[[r, c]].is_finite();
                if prev_ok && next_ok {
                    residuals.push(next_vel[[r, c]] - prev_vel[[r, c]]);
                    xs.push(stack.grid.x[c]);
                    ys.push(stack.grid.y[r]);
                }
            }
        }
        if residuals.is_empty() {
            return None;
        }
        log::debug!(
            "Overlap '{}' / '{}': {} cells",
            stack.ids[prev_layer],
            stack.ids[next_layer],
            residuals.len()
        );

        match self.method {
            MergeMethod::Mean => Some(Correction::Scalar(nanmean(residuals.iter().copied()))),
            MergeMethod::Median => Some(Correction::Scalar(nanmedian(residuals.iter().copied()))),
            MergeMethod::Mode => Some(Correction::Scalar(nanmode_rounded(residuals.iter().copied()))),
            MergeMethod::PlanarRamp => {
                let design: Vec<Vec<f64>> = xs
                    .iter()
                    .zip(ys.iter())
                    .map(|(&x, &y)| vec![1.0, x, y])
                    .collect();
                match ols_fit(&design, &residuals) {
                    Some(coeffs) => Some(Correction::Ramp {
                        offset: coeffs[0],
                        slope_x: coeffs[1],
                        slope_y: coeffs[2],
                        x: stack.grid.x.clone(),
                        y: stack.grid.y.clone(),
                    }),
                    // Degenerate overlap geometry: fall back to the mean
                    None => Some(Correction::Scalar(nanmean(residuals.iter().copied()))),
                }
            }
        }
    }

    /// Inverse-variance stack of a segment's corrected member layers into
    /// output layer `l` of `merged`
    fn stack_segment(
        &self,
        stack: &VelocityStack,
        seg: &MergedSegment,
        corrected: &[VelImage],
        merged: &mut VelocityStack,
        l: usize,
    ) {
        let (_, rows, cols) = stack.vel.dim();
        for r in 0..rows {
            for c in 0..cols {
                let mut in_footprint = false;
                let mut weight_sum = 0.0;
                let mut vel_sum = 0.0;
                let mut e_sum = 0.0;
                let mut n_sum = 0.0;
                let mut u_sum = 0.0;
                let mut n_contrib = 0usize;
                let mut single = (0.0, 0.0); // (vel, unc) of a lone contributor

                for (&member, vel) in seg.members.iter().zip(corrected) {
                    if stack.footprint[[member, r, c]] {
                        in_footprint = true;
                    }
                    let v = vel[[r, c]];
                    let sigma = stack.unc[[member, r, c]];
                    if !stack.footprint[[member, r, c]]
                        || !v.is_finite()
                        || !sigma.is_finite()
                        || sigma <= 0.0
                    {
                        continue;
                    }
                    let w = 1.0 / sigma;
                    weight_sum += w;
                    vel_sum += v * w;
                    e_sum += stack.comp_e[[member, r, c]];
                    n_sum += stack.comp_n[[member, r, c]];
                    u_sum += stack.comp_u[[member, r, c]];
                    n_contrib += 1;
                    single = (v, sigma);
                }

                merged.footprint[[l, r, c]] = in_footprint;
                if n_contrib == 0 {
                    // Masked inside the union footprint, Exterior outside
                    if in_footprint {
                        merged.vel[[l, r, c]] = f64::NAN;
                        merged.unc[[l, r, c]] = f64::NAN;
                        merged.comp_e[[l, r, c]] = f64::NAN;
                        merged.comp_n[[l, r, c]] = f64::NAN;
                        merged.comp_u[[l, r, c]] = f64::NAN;
                    }
                    continue;
                }
                if n_contrib == 1 {
                    // A lone contributor passes through unchanged, which
                    // also makes re-merging a merged track a no-op
                    merged.vel[[l, r, c]] = single.0;
                    merged.unc[[l, r, c]] = single.1;
                } else {
                    merged.vel[[l, r, c]] = vel_sum / weight_sum;
                    merged.unc[[l, r, c]] = 1.0 / weight_sum.sqrt();
                }
                merged.comp_e[[l, r, c]] = e_sum / n_contrib as f64;
                merged.comp_n[[l, r, c]] = n_sum / n_contrib as f64;
                merged.comp_u[[l, r, c]] = u_sum / n_contrib as f64;
            }
        }
    }
}

/// Offset correction for the later frame of a pair
enum Correction {
    Scalar(f64),
    Ramp {
        offset: f64,
        slope_x: f64,
        slope_y: f64,
        x: Vec<f64>,
        y: Vec<f64>,
    },
}

fn apply_correction(vel: &mut VelImage, correction: &Correction) {
    let (rows, cols) = vel.dim();
    match correction {
        Correction::Scalar(offset) => {
            for v in vel.iter_mut() {
                if v.is_finite() {
                    *v -= offset;
                }
            }
        }
        Correction::Ramp {
            offset,
            slope_x,
            slope_y,
            x,
            y,
        } => {
            for r in 0..rows {
                for c in 0..cols {
                    let v = &mut vel[[r, c]];
                    if v.is_finite() {
                        *v -= offset + slope_x * x[c] + slope_y * y[r];
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grid_unify::GridUnifier;
    use crate::types::Frame;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    /// Two frames of one ascending track covering y in [0,5] and [3,8],
    /// overlapping in y [3,5]
    fn overlapping_track(offset: f64) -> Vec<Frame> {
        let make = |name: &str, y0: f64, value_offset: f64| {
            let x: Vec<f64> = (0..4).map(|k| k as f64).collect();
            let y: Vec<f64> = (0..6).map(|k| y0 + k as f64).collect();
            let vel = Array2::from_elem((6, 4), 5.0 + value_offset);
            let unc = Array2::from_elem((6, 4), 1.0);
            let e = Array2::from_elem((6, 4), 0.6);
            let n = Array2::from_elem((6, 4), 0.1);
            let u = Array2::from_elem((6, 4), 0.79);
            Frame::new(name, x, y, vel, unc, e, n, u).unwrap()
        };
        vec![make("021A_one", 0.0, 0.0), make("021A_two", 3.0, offset)]
    }

    #[test]
    fn test_mean_merge_removes_offset() {
        let frames = overlapping_track(2.0);
        let stack = GridUnifier::new().unify(&frames).unwrap();
        let merged = TrackMerger::new(MergeMethod::Mean).merge(&stack).unwrap();
        assert_eq!(merged.n_layers(), 1);
        assert_eq!(merged.ids, vec!["021A".to_string()]);

        // The whole merged profile should sit at the first frame's level
        let (_, rows, cols) = merged.vel.dim();
        for r in 0..rows {
            for c in 0..cols {
                if merged.is_valid(0, r, c) {
                    assert_abs_diff_eq!(merged.vel[[0, r, c]], 5.0, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_median_and_mode_corrections() {
        for method in [MergeMethod::Median, MergeMethod::Mode] {
            let frames = overlapping_track(2.0);
            let stack = GridUnifier::new().unify(&frames).unwrap();
            let merged = TrackMerger::new(method).merge(&stack).unwrap();
            for v in merged.vel.iter().filter(|v| v.is_finite()) {
                assert_abs_diff_eq!(*v, 5.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_planar_ramp_recovery() {
        // Inject a linear ramp offset between the frames; ramp correction
        // must recover it to numerical precision
        let mut frames = overlapping_track(0.0);
        let (rows, cols) = frames[1].vel.dim();
        for r in 0..rows {
            for c in 0..cols {
                let x = frames[1].x[c];
                let y = frames[1].y[r];
                frames[1].vel[[r, c]] += 1.5 + 0.2 * x - 0.3 * y;
            }
        }
        let stack = GridUnifier::new().unify(&frames).unwrap();
        let merged = TrackMerger::new(MergeMethod::PlanarRamp)
            .merge(&stack)
            .unwrap();
        for v in merged.vel.iter().filter(|v| v.is_finite()) {
            assert_abs_diff_eq!(*v, 5.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_no_overlap_splits_segments() {
        let make = |name: &str, y0: f64| {
            let x: Vec<f64> = (0..3).map(|k| k as f64).collect();
            let y: Vec<f64> = (0..3).map(|k| y0 + k as f64).collect();
            let vel = Array2::from_elem((3, 3), 1.0);
            let unc = Array2::from_elem((3, 3), 1.0);
            let e = Array2::from_elem((3, 3), 0.6);
            let n = Array2::from_elem((3, 3), 0.0);
            let u = Array2::from_elem((3, 3), 0.8);
            Frame::new(name, x, y, vel, unc, e, n, u).unwrap()
        };
        let frames = vec![make("021A_one", 0.0), make("021A_two", 10.0)];
        let stack = GridUnifier::new().unify(&frames).unwrap();
        let merged = TrackMerger::new(MergeMethod::Mean).merge(&stack).unwrap();
        assert_eq!(merged.n_layers(), 2);
        assert_eq!(
            merged.ids,
            vec!["021A_1".to_string(), "021A_2".to_string()]
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let frames = overlapping_track(2.0);
        let stack = GridUnifier::new().unify(&frames).unwrap();
        let merger = TrackMerger::new(MergeMethod::Mean);
        let merged = merger.merge(&stack).unwrap();
        let again = merger.merge(&merged).unwrap();
        assert_eq!(again.n_layers(), merged.n_layers());
        assert_eq!(again.ids, merged.ids);
        for (a, b) in again.vel.iter().zip(merged.vel.iter()) {
            assert!((a.is_nan() && b.is_nan()) || (a - b).abs() < 1e-12);
        }
        for (a, b) in again.unc.iter().zip(merged.unc.iter()) {
            assert!((a.is_nan() && b.is_nan()) || (a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_inverse_variance_weighting_in_overlap() {
        let mut frames = overlapping_track(0.0);
        // Distinct uncertainties; values differ so the weighted mean shows
        frames[0].vel.fill(4.0);
        frames[0].unc.fill(1.0);
        frames[1].vel.fill(6.0);
        frames[1].unc.fill(3.0);
        let stack = GridUnifier::new().unify(&frames).unwrap();
        // Mean correction would cancel the difference, so bypass it by
        // checking a mode where the offset is zero after correction:
        // correction subtracts +2 from frame two, leaving both at 4.
        let merged = TrackMerger::new(MergeMethod::Mean).merge(&stack).unwrap();
        // In the overlap both frames contribute; weights 1 and 1/3
        let row = stack
            .grid
            .y
            .iter()
            .position(|&y| (y - 4.0).abs() < 1e-9)
            .unwrap();
        assert!(merged.is_valid(0, row, 1));
        assert_abs_diff_eq!(merged.vel[[0, row, 1]], 4.0, epsilon = 1e-9);
        let expected_unc = 1.0 / (1.0_f64 + 1.0 / 3.0).sqrt();
        assert_abs_diff_eq!(merged.unc[[0, row, 1]], expected_unc, epsilon = 1e-9);
    }
}
