//! Reference-frame tie: estimates and subtracts a smooth bias surface per
//! merged track/frame layer relative to an external (e.g. GNSS-derived)
//! velocity field.

use crate::core::math::{moving_mean_nan, nanmean, ols_fit};
use crate::types::{
    CellState, FusionError, FusionResult, ReferenceField, VelImage, VelocityStack,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Deramped velocities above this magnitude are treated as localized signal
/// (subsidence, seismic deformation) and excluded from the bias estimate
pub const DERAMP_SIGNAL_THRESHOLD: f64 = 10.0;

/// Reference-frame tie method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefMethod {
    /// No tie applied
    None,
    /// Fit a 1st- or 2nd-order 2D polynomial to the residual
    Polynomial,
    /// NaN-aware moving-average filter of the residual
    Filter,
}

/// Reference-frame tie processor
pub struct GnssReferencer {
    method: RefMethod,
    poly_order: Option<u32>,
    filter_window: usize,
}

impl GnssReferencer {
    /// Validates the configuration up front: polynomial order must be set
    /// (1 or 2) for the polynomial method, and the filter window must be
    /// odd for the filter method.
    pub fn new(
        method: RefMethod,
        poly_order: Option<u32>,
        filter_window: usize,
    ) -> FusionResult<Self> {
        match method {
            RefMethod::Polynomial => match poly_order {
                Some(1) | Some(2) => {}
                Some(order) => {
                    return Err(FusionError::Configuration(format!(
                        "Polynomial referencing order must be 1 or 2, got {}",
                        order
                    )))
                }
                None => {
                    return Err(FusionError::Configuration(
                        "Polynomial referencing selected but no order set".to_string(),
                    ))
                }
            },
            RefMethod::Filter => {
                if filter_window % 2 == 0 || filter_window == 0 {
                    return Err(FusionError::Configuration(format!(
                        "Reference filter window must be odd, got {}",
                        filter_window
                    )));
                }
            }
            RefMethod::None => {}
        }
        Ok(GnssReferencer {
            method,
            poly_order,
            filter_window,
        })
    }

    /// Estimate and subtract a bias surface for every layer of the stack.
    ///
    /// The reference field must already be on the stack's grid. Returns the
    /// correction surfaces (one per layer, all-NaN for skipped layers) as a
    /// diagnostic.
    pub fn apply(
        &self,
        stack: &mut VelocityStack,
        reference: &ReferenceField,
    ) -> FusionResult<Vec<VelImage>> {
        let (rows, cols) = stack.grid.shape();
        if reference.east.dim() != (rows, cols) || reference.north.dim() != (rows, cols) {
            return Err(FusionError::InvalidData(
                "Reference field is not on the common grid".to_string(),
            ));
        }
        if self.method == RefMethod::None {
            log::info!("Reference tie disabled; leaving velocities untouched");
            return Ok(vec![
                Array2::from_elem((rows, cols), f64::NAN);
                stack.n_layers()
            ]);
        }

        log::info!(
            "Referencing {} layers to the external velocity field ({:?})",
            stack.n_layers(),
            self.method
        );

        let mut surfaces = Vec::with_capacity(stack.n_layers());
        for l in 0..stack.n_layers() {
            if stack.valid_count(l) == 0 {
                log::warn!(
                    "Layer '{}' has no valid pixels; skipping reference tie",
                    stack.ids[l]
                );
                surfaces.push(Array2::from_elem((rows, cols), f64::NAN));
                continue;
            }
            let surface = self.reference_layer(stack, l, reference)?;
            surfaces.push(surface);
        }
        Ok(surfaces)
    }

    fn reference_layer(
        &self,
        stack: &mut VelocityStack,
        layer: usize,
        reference: &ReferenceField,
    ) -> FusionResult<VelImage> {
        let (rows, cols) = stack.grid.shape();

        // Project the reference field into this layer's LOS
        let mut los_ref = Array2::from_elem((rows, cols), f64::NAN);
        for r in 0..rows {
            for c in 0..cols {
                if stack.is_valid(layer, r, c) {
                    los_ref[[r, c]] = reference.east[[r, c]] * stack.comp_e[[layer, r, c]]
                        + reference.north[[r, c]] * stack.comp_n[[layer, r, c]];
                }
            }
        }

        // First-pass deramp to find large localized signals that would bias
        // the surface estimate; this masking only affects the residual
        let signal_mask = self.deramp_signal_mask(stack, layer);

        // Residual against the reference, with signal cells masked
        let mut residual = Array2::from_elem((rows, cols), f64::NAN);
        let mut n_residual = 0usize;
        for r in 0..rows {
            for c in 0..cols {
                if stack.is_valid(layer, r, c) && !signal_mask[[r, c]] && los_ref[[r, c]].is_finite()
                {
                    residual[[r, c]] = stack.vel[[layer, r, c]] - los_ref[[r, c]];
                    n_residual += 1;
                }
            }
        }
        if n_residual == 0 {
            log::warn!(
                "Layer '{}': no residual cells against the reference; skipping",
                stack.ids[layer]
            );
            return Ok(Array2::from_elem((rows, cols), f64::NAN));
        }
        log::debug!(
            "Layer '{}': fitting bias surface to {} residual cells",
            stack.ids[layer],
            n_residual
        );

        let surface = match self.method {
            RefMethod::Polynomial => {
                self.polynomial_surface(stack, &residual, self.poly_order.unwrap())?
            }
            RefMethod::Filter => {
                let filtered = moving_mean_nan(&residual, self.filter_window);
                // Re-apply the residual's own NaN mask: the filter must not
                // invent values in gaps
                let mut out = filtered;
                for (o, res) in out.iter_mut().zip(residual.iter()) {
                    if !res.is_finite() {
                        *o = f64::NAN;
                    }
                }
                out
            }
            RefMethod::None => unreachable!(),
        };

        // Intersect the surface with the layer's three-state footprint and
        // subtract it from the original (un-deramped) velocity
        let mut stored = Array2::from_elem((rows, cols), f64::NAN);
        for r in 0..rows {
            for c in 0..cols {
                let cell = stack.state(layer, r, c);
                stored[[r, c]] = match cell {
                    CellState::Exterior => 0.0,
                    CellState::Masked => f64::NAN,
                    CellState::Value(v) => {
                        let s = surface[[r, c]];
                        if s.is_finite() {
                            stack.vel[[layer, r, c]] = v - s;
                            s
                        } else {
                            // No estimate here; the velocity stays as is
                            f64::NAN
                        }
                    }
                };
            }
        }
        Ok(stored)
    }

    /// True where the deramped, recentered velocity exceeds the signal
    /// threshold
    fn deramp_signal_mask(&self, stack: &VelocityStack, layer: usize) -> Array2<bool> {
        let (rows, cols) = stack.grid.shape();
        let mut mask = Array2::from_elem((rows, cols), false);

        let mut design = Vec::new();
        let mut obs = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                if stack.is_valid(layer, r, c) {
                    design.push(vec![1.0, stack.grid.x[c], stack.grid.y[r]]);
                    obs.push(stack.vel[[layer, r, c]]);
                }
            }
        }
        let plane = match ols_fit(&design, &obs) {
            Some(p) => p,
            // Degenerate geometry: keep everything
            None => return mask,
        };

        let mut deramped = Array2::from_elem((rows, cols), f64::NAN);
        for r in 0..rows {
            for c in 0..cols {
                if stack.is_valid(layer, r, c) {
                    deramped[[r, c]] = stack.vel[[layer, r, c]]
                        - (plane[0] + plane[1] * stack.grid.x[c] + plane[2] * stack.grid.y[r]);
                }
            }
        }
        let mean = nanmean(deramped.iter().copied());
        for (m, d) in mask.iter_mut().zip(deramped.iter()) {
            if d.is_finite() && (d - mean).abs() > DERAMP_SIGNAL_THRESHOLD {
                *m = true;
            }
        }
        mask
    }

    /// Fit a 1st- or 2nd-order 2D polynomial to the residual and evaluate
    /// it over the full grid. Coordinates are recentered to their midpoint
    /// for conditioning.
    fn polynomial_surface(
        &self,
        stack: &VelocityStack,
        residual: &VelImage,
        order: u32,
    ) -> FusionResult<VelImage> {
        let (rows, cols) = residual.dim();

        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut zs = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                let z = residual[[r, c]];
                if z.is_finite() {
                    xs.push(stack.grid.x[c]);
                    ys.push(stack.grid.y[r]);
                    zs.push(z);
                }
            }
        }

        let x_mid = 0.5
            * (xs.iter().fold(f64::INFINITY, |a, &b| a.min(b))
                + xs.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b)));
        let y_mid = 0.5
            * (ys.iter().fold(f64::INFINITY, |a, &b| a.min(b))
                + ys.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b)));

        let terms = |x: f64, y: f64| -> Vec<f64> {
            let (x, y) = (x - x_mid, y - y_mid);
            match order {
                1 => vec![1.0, x, y],
                _ => vec![1.0, x, y, x * y, x * x, y * y],
            }
        };

        let design: Vec<Vec<f64>> = xs
            .iter()
            .zip(ys.iter())
            .map(|(&x, &y)| terms(x, y))
            .collect();
        let coeffs = ols_fit(&design, &zs).ok_or_else(|| {
            FusionError::Processing(
                "Polynomial bias-surface fit is singular (degenerate residual geometry)"
                    .to_string(),
            )
        })?;

        let mut surface = Array2::zeros((rows, cols));
        for r in 0..rows {
            for c in 0..cols {
                let t = terms(stack.grid.x[c], stack.grid.y[r]);
                surface[[r, c]] = t.iter().zip(coeffs.iter()).map(|(a, b)| a * b).sum();
            }
        }
        Ok(surface)
    }
}
