//! Per-pixel weighted least-squares decomposition of multi-geometry LOS
//! velocities into East/North/Up components, with condition-number and
//! variance quality masks.
//!
//! Pixels are independent, so the grid is split into row chunks processed
//! by worker threads writing disjoint output rows; the worker count changes
//! timing only, never results.

use crate::core::math::wls_fit;
use crate::types::{
    DecompositionResult, FusionError, FusionResult, ReferenceField, VelocityStack,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Handling of the North component in the direct solve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NorthTreatment {
    /// Subtract the reference North projection from the observations
    SubtractReference,
    /// Include North as a third unknown in the design matrix
    EstimateUnknown,
    /// Assume the North component is zero
    AssumeZero,
}

/// Decomposition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecompositionMode {
    /// Recover (East, Up) in one weighted least-squares solve
    Direct(NorthTreatment),
    /// First recover (East, combined North-Up), then split the combined
    /// term using the observation geometry and the reference North field
    TwoStage,
}

/// Per-pixel decomposition processor
pub struct Decomposer {
    mode: DecompositionMode,
    /// Condition-number threshold for the ill-conditioned mask; 0 disables
    condition_threshold: f64,
    /// Parameter-variance threshold for the high-variance mask; 0 disables
    variance_threshold: f64,
    /// Worker threads; 0 runs sequentially
    workers: usize,
}

/// Output of one grid row, assembled into the result arrays afterwards
struct RowSolution {
    east: Vec<f64>,
    north: Vec<f64>,
    up: Vec<f64>,
    var_east: Vec<f64>,
    var_north: Vec<f64>,
    var_up: Vec<f64>,
    ill_conditioned: Vec<bool>,
    high_variance: Vec<bool>,
    /// Pixels with >= 2 independent look directions in this row
    candidates: usize,
    solved: usize,
}

/// One LOS observation contributing to a pixel
#[derive(Clone, Copy)]
struct Observation {
    vel: f64,
    variance: f64,
    e: f64,
    n: f64,
    u: f64,
}

impl Decomposer {
    pub fn new(mode: DecompositionMode) -> Self {
        Decomposer {
            mode,
            condition_threshold: 0.0,
            variance_threshold: 0.0,
            workers: 0,
        }
    }

    pub fn with_thresholds(mut self, condition: f64, variance: f64) -> Self {
        self.condition_threshold = condition;
        self.variance_threshold = variance;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Decompose the stack into ground-motion components.
    ///
    /// A singular per-pixel system is skipped (left no-data); the run fails
    /// only when no pixel anywhere has the required multi-geometry
    /// coverage, or when the selected mode needs a reference field that was
    /// not supplied.
    pub fn decompose(
        &self,
        stack: &VelocityStack,
        reference: Option<&ReferenceField>,
    ) -> FusionResult<DecompositionResult> {
        let needs_reference = matches!(
            self.mode,
            DecompositionMode::Direct(NorthTreatment::SubtractReference)
                | DecompositionMode::TwoStage
        );
        if needs_reference && reference.is_none() {
            return Err(FusionError::Configuration(format!(
                "Decomposition mode {:?} requires a reference velocity field",
                self.mode
            )));
        }
        let (rows, cols) = stack.grid.shape();
        if let Some(reference) = reference {
            if reference.north.dim() != (rows, cols) {
                return Err(FusionError::InvalidData(
                    "Reference field is not on the common grid".to_string(),
                ));
            }
        }

        log::info!(
            "Decomposing {} layers over {}x{} grid ({:?}, {} workers)",
            stack.n_layers(),
            rows,
            cols,
            self.mode,
            self.workers
        );

        let solutions = if self.workers > 0 {
            self.solve_rows_parallel(stack, reference, rows)?
        } else {
            (0..rows).map(|r| self.solve_row(stack, reference, r)).collect()
        };

        let candidates: usize = solutions.iter().map(|s| s.candidates).sum();
        let solved: usize = solutions.iter().map(|s| s.solved).sum();
        if candidates == 0 {
            return Err(FusionError::Configuration(
                "No pixel has observations from two independent look directions".to_string(),
            ));
        }

        let estimates_north = matches!(
            self.mode,
            DecompositionMode::Direct(NorthTreatment::EstimateUnknown) | DecompositionMode::TwoStage
        );
        let mut result = DecompositionResult {
            east: Array2::from_elem((rows, cols), f64::NAN),
            up: Array2::from_elem((rows, cols), f64::NAN),
            north: estimates_north.then(|| Array2::from_elem((rows, cols), f64::NAN)),
            var_east: Array2::from_elem((rows, cols), f64::NAN),
            var_up: Array2::from_elem((rows, cols), f64::NAN),
            var_north: estimates_north.then(|| Array2::from_elem((rows, cols), f64::NAN)),
            ill_conditioned: Array2::from_elem((rows, cols), false),
            high_variance: Array2::from_elem((rows, cols), false),
            solved_pixels: solved,
        };
        for (r, row) in solutions.into_iter().enumerate() {
            for c in 0..cols {
                result.east[[r, c]] = row.east[c];
                result.up[[r, c]] = row.up[c];
                result.var_east[[r, c]] = row.var_east[c];
                result.var_up[[r, c]] = row.var_up[c];
                if let Some(north) = result.north.as_mut() {
                    north[[r, c]] = row.north[c];
                }
                if let Some(var_north) = result.var_north.as_mut() {
                    var_north[[r, c]] = row.var_north[c];
                }
                result.ill_conditioned[[r, c]] = row.ill_conditioned[c];
                result.high_variance[[r, c]] = row.high_variance[c];
            }
        }

        log::info!(
            "Decomposition complete: {} of {} multi-geometry pixels solved",
            solved,
            candidates
        );
        Ok(result)
    }

    #[cfg(feature = "parallel")]
    fn solve_rows_parallel(
        &self,
        stack: &VelocityStack,
        reference: Option<&ReferenceField>,
        rows: usize,
    ) -> FusionResult<Vec<RowSolution>> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| {
                FusionError::Processing(format!("Failed to build worker pool: {}", e))
            })?;
        Ok(pool.install(|| {
            (0..rows)
                .into_par_iter()
                .map(|r| self.solve_row(stack, reference, r))
                .collect()
        }))
    }

    #[cfg(not(feature = "parallel"))]
    fn solve_rows_parallel(
        &self,
        stack: &VelocityStack,
        reference: Option<&ReferenceField>,
        rows: usize,
    ) -> FusionResult<Vec<RowSolution>> {
        Ok((0..rows)
            .map(|r| self.solve_row(stack, reference, r))
            .collect())
    }

    fn solve_row(
        &self,
        stack: &VelocityStack,
        reference: Option<&ReferenceField>,
        r: usize,
    ) -> RowSolution {
        let (_, _, cols) = stack.vel.dim();
        let mut row = RowSolution {
            east: vec![f64::NAN; cols],
            north: vec![f64::NAN; cols],
            up: vec![f64::NAN; cols],
            var_east: vec![f64::NAN; cols],
            var_north: vec![f64::NAN; cols],
            var_up: vec![f64::NAN; cols],
            ill_conditioned: vec![false; cols],
            high_variance: vec![false; cols],
            candidates: 0,
            solved: 0,
        };

        for c in 0..cols {
            let observations = self.gather_observations(stack, r, c);
            if observations.len() < 2 || !has_independent_looks(&observations) {
                continue;
            }
            row.candidates += 1;
            if self.solve_pixel(&observations, reference, r, c, &mut row) {
                row.solved += 1;
            }
        }
        row
    }

    fn gather_observations(
        &self,
        stack: &VelocityStack,
        r: usize,
        c: usize,
    ) -> Vec<Observation> {
        let mut observations = Vec::new();
        for l in 0..stack.n_layers() {
            if !stack.is_valid(l, r, c) {
                continue;
            }
            let sigma = stack.unc[[l, r, c]];
            let e = stack.comp_e[[l, r, c]];
            let n = stack.comp_n[[l, r, c]];
            let u = stack.comp_u[[l, r, c]];
            if !sigma.is_finite() || sigma <= 0.0 || !e.is_finite() || !n.is_finite() || !u.is_finite() {
                continue;
            }
            observations.push(Observation {
                vel: stack.vel[[l, r, c]],
                variance: sigma * sigma,
                e,
                n,
                u,
            });
        }
        observations
    }

    /// Solve one pixel; returns false when the system is skipped
    fn solve_pixel(
        &self,
        observations: &[Observation],
        reference: Option<&ReferenceField>,
        r: usize,
        c: usize,
        row: &mut RowSolution,
    ) -> bool {
        let n_ref = reference
            .map(|field| field.north[[r, c]])
            .filter(|v| v.is_finite())
            .unwrap_or(0.0);
        let weights: Vec<f64> = observations.iter().map(|o| 1.0 / o.variance).collect();

        let solution = match self.mode {
            DecompositionMode::Direct(treatment) => {
                let (design, obs): (Vec<Vec<f64>>, Vec<f64>) = match treatment {
                    NorthTreatment::SubtractReference => observations
                        .iter()
                        .map(|o| (vec![o.e, o.u], o.vel - o.n * n_ref))
                        .unzip(),
                    NorthTreatment::AssumeZero => observations
                        .iter()
                        .map(|o| (vec![o.e, o.u], o.vel))
                        .unzip(),
                    NorthTreatment::EstimateUnknown => observations
                        .iter()
                        .map(|o| (vec![o.e, o.n, o.u], o.vel))
                        .unzip(),
                };
                match wls_fit(&design, &obs, &weights) {
                    Some(solution) => solution,
                    None => return false,
                }
            }
            DecompositionMode::TwoStage => {
                let (design, obs): (Vec<Vec<f64>>, Vec<f64>) = observations
                    .iter()
                    .map(|o| (vec![o.e, o.n.hypot(o.u)], o.vel))
                    .unzip();
                match wls_fit(&design, &obs, &weights) {
                    Some(solution) => solution,
                    None => return false,
                }
            }
        };

        // Instability is surfaced as masks, never as a failure
        if self.condition_threshold > 0.0 && solution.condition > self.condition_threshold {
            row.ill_conditioned[c] = true;
        }
        if self.variance_threshold > 0.0
            && solution.variances.iter().any(|&v| v > self.variance_threshold)
        {
            row.high_variance[c] = true;
        }

        match self.mode {
            DecompositionMode::Direct(NorthTreatment::EstimateUnknown) => {
                row.east[c] = solution.params[0];
                row.north[c] = solution.params[1];
                row.up[c] = solution.params[2];
                row.var_east[c] = solution.variances[0];
                row.var_north[c] = solution.variances[1];
                row.var_up[c] = solution.variances[2];
            }
            DecompositionMode::Direct(_) => {
                row.east[c] = solution.params[0];
                row.up[c] = solution.params[1];
                row.var_east[c] = solution.variances[0];
                row.var_up[c] = solution.variances[1];
            }
            DecompositionMode::TwoStage => {
                // Split the combined North-Up term with the mean normalized
                // geometry of the contributing observations
                let n_mean = observations.iter().map(|o| o.n).sum::<f64>()
                    / observations.len() as f64;
                let u_mean = observations.iter().map(|o| o.u).sum::<f64>()
                    / observations.len() as f64;
                let h = n_mean.hypot(u_mean);
                if !(h > 0.0) || u_mean.abs() / h < 1e-6 {
                    return false;
                }
                let (n_hat, u_hat) = (n_mean / h, u_mean / h);
                let combined = solution.params[1];
                row.east[c] = solution.params[0];
                row.north[c] = n_ref;
                row.up[c] = (combined - n_hat * n_ref) / u_hat;
                row.var_east[c] = solution.variances[0];
                row.var_up[c] = solution.variances[1] / (u_hat * u_hat);
                row.var_north[c] = reference
                    .and_then(|field| field.unc_north.as_ref())
                    .map(|unc| unc[[r, c]] * unc[[r, c]])
                    .unwrap_or(0.0);
            }
        }
        true
    }
}

/// True when at least one pair of observations looks along genuinely
/// different directions. Layers sharing one geometry can never separate the
/// components, so such pixels do not count as multi-geometry coverage.
fn has_independent_looks(observations: &[Observation]) -> bool {
    const PARALLEL_EPS: f64 = 1e-9;
    for (i, a) in observations.iter().enumerate() {
        for b in &observations[i + 1..] {
            let cx = a.n * b.u - a.u * b.n;
            let cy = a.u * b.e - a.e * b.u;
            let cz = a.e * b.n - a.n * b.e;
            if (cx * cx + cy * cy + cz * cz).sqrt() > PARALLEL_EPS {
                return true;
            }
        }
    }
    false
}
