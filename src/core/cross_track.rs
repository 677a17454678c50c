//! Across-track diagnostic merge: reprojects along-track-merged tracks to a
//! canonical viewing geometry per pass direction and aligns them for
//! inspection. The output never feeds the decomposer.

use crate::core::math::{nanmean, nanmedian, solve_dense};
use crate::types::{FusionError, FusionResult, PassDirection, VelImage, VelocityStack};
use ndarray::Array2;

/// Projection factors below this are masked instead of amplified
const MIN_PROJECTION_FACTOR: f64 = 0.2;

/// Canonical viewing geometry for one pass direction
#[derive(Debug, Clone, Copy)]
pub struct CanonicalGeometry {
    /// Incidence angle from vertical (radians)
    pub incidence: f64,
    /// Look azimuth, atan2(east, north) (radians)
    pub azimuth: f64,
}

impl CanonicalGeometry {
    /// LOS unit vector (east, north, up) of this geometry
    pub fn unit_vector(&self) -> (f64, f64, f64) {
        let sin_inc = self.incidence.sin();
        (
            sin_inc * self.azimuth.sin(),
            sin_inc * self.azimuth.cos(),
            self.incidence.cos(),
        )
    }
}

/// Per-pass averaged LOS field in canonical geometry
#[derive(Debug, Clone)]
pub struct PassAverage {
    pub geometry: CanonicalGeometry,
    pub los: VelImage,
    pub n_tracks: usize,
}

/// Diagnostic across-track merge output
#[derive(Debug, Clone)]
pub struct CrossTrackResult {
    pub ascending: Option<PassAverage>,
    pub descending: Option<PassAverage>,
    /// Simple East/Up check solve over the sub-region valid in both pass
    /// averages, when both exist
    pub east_up: Option<(VelImage, VelImage)>,
}

/// Across-track diagnostic processor
pub struct CrossTrackMerger;

impl CrossTrackMerger {
    pub fn new() -> Self {
        CrossTrackMerger
    }

    /// Reproject, align and average the merged tracks per pass direction.
    pub fn merge(&self, stack: &VelocityStack) -> FusionResult<CrossTrackResult> {
        log::info!(
            "Across-track diagnostic merge of {} track layers",
            stack.n_layers()
        );

        let ascending = self.merge_pass(stack, PassDirection::Ascending)?;
        let descending = self.merge_pass(stack, PassDirection::Descending)?;

        let east_up = match (&ascending, &descending) {
            (Some(asc), Some(desc)) => Some(self.east_up_check(asc, desc)),
            _ => None,
        };

        Ok(CrossTrackResult {
            ascending,
            descending,
            east_up,
        })
    }

    fn merge_pass(
        &self,
        stack: &VelocityStack,
        pass: PassDirection,
    ) -> FusionResult<Option<PassAverage>> {
        // Tracks of this pass with any valid data, ordered by the spatial
        // key: minimum valid-data x coordinate
        let mut layers: Vec<(usize, f64)> = Vec::new();
        for l in 0..stack.n_layers() {
            if stack.passes[l] != pass {
                continue;
            }
            match self.min_valid_x(stack, l) {
                Some(key) => layers.push((l, key)),
                None => log::warn!(
                    "Track '{}' has no valid data; skipping in across-track merge",
                    stack.ids[l]
                ),
            }
        }
        if layers.is_empty() {
            return Ok(None);
        }
        layers.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

        let geometry = self.canonical_geometry(stack, layers[0].0)?;
        let (e0, n0, u0) = geometry.unit_vector();
        log::debug!(
            "Canonical {} geometry: incidence {:.2} deg, azimuth {:.2} deg",
            pass,
            geometry.incidence.to_degrees(),
            geometry.azimuth.to_degrees()
        );

        // Reproject every track into the canonical geometry
        let (_, rows, cols) = stack.vel.dim();
        let mut projected: Vec<VelImage> = Vec::with_capacity(layers.len());
        for &(l, _) in &layers {
            let mut out = Array2::from_elem((rows, cols), f64::NAN);
            for r in 0..rows {
                for c in 0..cols {
                    if !stack.is_valid(l, r, c) {
                        continue;
                    }
                    let factor = stack.comp_e[[l, r, c]] * e0
                        + stack.comp_n[[l, r, c]] * n0
                        + stack.comp_u[[l, r, c]] * u0;
                    if factor.is_finite() && factor > MIN_PROJECTION_FACTOR {
                        out[[r, c]] = stack.vel[[l, r, c]] / factor;
                    }
                }
            }
            projected.push(out);
        }

        // Sequential constant-offset alignment of adjacent pairs
        for k in 1..projected.len() {
            let mut residuals = Vec::new();
            for (a, b) in projected[k - 1].iter().zip(projected[k].iter()) {
                if a.is_finite() && b.is_finite() {
                    residuals.push(b - a);
                }
            }
            if residuals.is_empty() {
                log::warn!(
                    "No overlap between adjacent {} tracks '{}' and '{}'",
                    pass,
                    stack.ids[layers[k - 1].0],
                    stack.ids[layers[k].0]
                );
                continue;
            }
            // Constant least-squares offset reduces to the overlap mean
            let offset = nanmean(residuals.iter().copied());
            for v in projected[k].iter_mut() {
                if v.is_finite() {
                    *v -= offset;
                }
            }
        }

        // Average LOS per pass
        let mut los = Array2::from_elem((rows, cols), f64::NAN);
        for r in 0..rows {
            for c in 0..cols {
                los[[r, c]] = nanmean(projected.iter().map(|p| p[[r, c]]));
            }
        }

        Ok(Some(PassAverage {
            geometry,
            los,
            n_tracks: layers.len(),
        }))
    }

    /// Median incidence/azimuth of one track, from the unit-vector layers
    /// via inverse trigonometric relations
    fn canonical_geometry(
        &self,
        stack: &VelocityStack,
        layer: usize,
    ) -> FusionResult<CanonicalGeometry> {
        let (_, rows, cols) = stack.vel.dim();
        let mut incidences = Vec::new();
        let mut azimuths = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                if !stack.is_valid(layer, r, c) {
                    continue;
                }
                let u = stack.comp_u[[layer, r, c]];
                if u.is_finite() && u.abs() <= 1.0 {
                    incidences.push(u.acos());
                }
                let e = stack.comp_e[[layer, r, c]];
                let n = stack.comp_n[[layer, r, c]];
                if e.is_finite() && n.is_finite() {
                    azimuths.push(e.atan2(n));
                }
            }
        }
        if incidences.is_empty() {
            return Err(FusionError::Processing(format!(
                "Track '{}' has no usable viewing geometry",
                stack.ids[layer]
            )));
        }
        Ok(CanonicalGeometry {
            incidence: nanmedian(incidences),
            azimuth: nanmedian(azimuths),
        })
    }

    fn min_valid_x(&self, stack: &VelocityStack, layer: usize) -> Option<f64> {
        let (_, rows, cols) = stack.vel.dim();
        for c in 0..cols {
            for r in 0..rows {
                if stack.is_valid(layer, r, c) {
                    return Some(stack.grid.x[c]);
                }
            }
        }
        None
    }

    /// Two-component (East, Up) solve from the two canonical pass
    /// geometries, over the sub-region valid in both averages
    fn east_up_check(&self, asc: &PassAverage, desc: &PassAverage) -> (VelImage, VelImage) {
        let (rows, cols) = asc.los.dim();
        let mut east = Array2::from_elem((rows, cols), f64::NAN);
        let mut up = Array2::from_elem((rows, cols), f64::NAN);
        let (ea, _, ua) = asc.geometry.unit_vector();
        let (ed, _, ud) = desc.geometry.unit_vector();

        for r in 0..rows {
            for c in 0..cols {
                let va = asc.los[[r, c]];
                let vd = desc.los[[r, c]];
                if !va.is_finite() || !vd.is_finite() {
                    continue;
                }
                let design = vec![vec![ea, ua], vec![ed, ud]];
                if let Some(m) = solve_dense(design, vec![va, vd]) {
                    east[[r, c]] = m[0];
                    up[[r, c]] = m[1];
                }
            }
        }
        (east, up)
    }
}

impl Default for CrossTrackMerger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Grid, PassDirection, VelocityStack};
    use approx::assert_abs_diff_eq;

    /// Stack with one ascending and one descending layer of uniform
    /// geometry, synthesized from a known (east, up) ground motion
    fn synthetic_two_pass(east: f64, up: f64) -> VelocityStack {
        let n = 4;
        let grid = Grid {
            x: (0..n).map(|k| k as f64).collect(),
            y: (0..n).map(|k| k as f64).collect(),
            dx: 1.0,
            dy: 1.0,
        };
        let mut stack = VelocityStack::zeros(grid, 2);
        stack.ids = vec!["010A".to_string(), "020D".to_string()];
        stack.passes = vec![PassDirection::Ascending, PassDirection::Descending];

        let geoms = [(-0.6_f64, 0.05_f64), (0.6_f64, 0.05_f64)];
        for (l, &(e, nn)) in geoms.iter().enumerate() {
            let u = (1.0 - e * e - nn * nn).sqrt();
            for r in 0..n {
                for c in 0..n {
                    stack.vel[[l, r, c]] = e * east + u * up;
                    stack.unc[[l, r, c]] = 1.0;
                    stack.comp_e[[l, r, c]] = e;
                    stack.comp_n[[l, r, c]] = nn;
                    stack.comp_u[[l, r, c]] = u;
                    stack.footprint[[l, r, c]] = true;
                }
            }
        }
        stack
    }

    #[test]
    fn test_pass_averages_and_check_solve() {
        let stack = synthetic_two_pass(3.0, -1.0);
        let result = CrossTrackMerger::new().merge(&stack).unwrap();
        let asc = result.ascending.expect("ascending average");
        let desc = result.descending.expect("descending average");
        assert_eq!(asc.n_tracks, 1);
        assert_eq!(desc.n_tracks, 1);

        // Uniform geometry: canonical projection factor is 1, so the
        // averages reproduce the input LOS fields
        assert_abs_diff_eq!(
            asc.los[[1, 1]],
            stack.vel[[0, 1, 1]],
            epsilon = 1e-9
        );

        // The East/Up check solve must round-trip the synthetic motion up
        // to the small unresolved North component
        let (east, up) = result.east_up.expect("east/up check");
        assert_abs_diff_eq!(east[[2, 2]], 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(up[[2, 2]], -1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_single_pass_yields_no_check_solve() {
        let mut stack = synthetic_two_pass(1.0, 0.0);
        stack.passes[1] = PassDirection::Ascending;
        stack.ids[1] = "020A".to_string();
        let result = CrossTrackMerger::new().merge(&stack).unwrap();
        assert!(result.descending.is_none());
        assert!(result.east_up.is_none());
    }
}
