//! Grid unification: resamples heterogeneous per-frame rasters onto one
//! common lattice and stacks them, keeping the Exterior / Masked distinction
//! intact for the downstream overlap and footprint logic.

use crate::core::math::bilinear_sample;
use crate::types::{
    BoundingBox, Frame, FusionError, FusionResult, Grid, ReferenceField, UnitVectorLayers,
    VelImage, VelocityStack,
};
use ndarray::Array2;

/// Grid unification processor
pub struct GridUnifier;

/// One frame resampled onto the common grid, before stacking
struct ResampledLayer {
    vel: VelImage,
    unc: VelImage,
    comp_e: VelImage,
    comp_n: VelImage,
    comp_u: VelImage,
    footprint: Array2<bool>,
    valid_pixels: usize,
}

impl GridUnifier {
    pub fn new() -> Self {
        GridUnifier
    }

    /// Resample all frames onto the common grid and stack them.
    ///
    /// Frames left entirely invalid after masking are dropped with a
    /// warning; unification fails only when no frame survives.
    pub fn unify(&self, frames: &[Frame]) -> FusionResult<VelocityStack> {
        if frames.is_empty() {
            return Err(FusionError::Configuration(
                "No input frames provided".to_string(),
            ));
        }

        let grid = Self::common_grid(frames)?;
        let (rows, cols) = grid.shape();
        log::info!(
            "Unifying {} frames onto {}x{} grid (dx={:.6}, dy={:.6})",
            frames.len(),
            rows,
            cols,
            grid.dx,
            grid.dy
        );

        let mut survivors = Vec::new();
        for frame in frames {
            let layer = self.resample_frame(frame, &grid);
            if layer.valid_pixels == 0 {
                log::warn!(
                    "Frame '{}' has no valid pixels after masking; dropping it",
                    frame.name
                );
                continue;
            }
            log::debug!(
                "Frame '{}': {} valid pixels on the common grid",
                frame.name,
                layer.valid_pixels
            );
            survivors.push((frame, layer));
        }

        if survivors.is_empty() {
            return Err(FusionError::Configuration(
                "No valid input frames after masking".to_string(),
            ));
        }

        let mut stack = VelocityStack::zeros(grid, survivors.len());
        for (l, (frame, layer)) in survivors.into_iter().enumerate() {
            stack.ids.push(frame.name.clone());
            stack.passes.push(frame.pass);
            stack.vel.index_axis_mut(ndarray::Axis(0), l).assign(&layer.vel);
            stack.unc.index_axis_mut(ndarray::Axis(0), l).assign(&layer.unc);
            stack
                .comp_e
                .index_axis_mut(ndarray::Axis(0), l)
                .assign(&layer.comp_e);
            stack
                .comp_n
                .index_axis_mut(ndarray::Axis(0), l)
                .assign(&layer.comp_n);
            stack
                .comp_u
                .index_axis_mut(ndarray::Axis(0), l)
                .assign(&layer.comp_u);
            stack
                .footprint
                .index_axis_mut(ndarray::Axis(0), l)
                .assign(&layer.footprint);
        }

        log::info!("Unification complete: {} layers stacked", stack.n_layers());
        Ok(stack)
    }

    /// Common lattice: minimum per-axis spacing, union bounding box
    pub fn common_grid(frames: &[Frame]) -> FusionResult<Grid> {
        if frames.is_empty() {
            return Err(FusionError::Configuration(
                "No input frames provided".to_string(),
            ));
        }
        let dx = frames
            .iter()
            .map(|f| f.dx())
            .fold(f64::INFINITY, f64::min);
        let dy = frames
            .iter()
            .map(|f| f.dy())
            .fold(f64::INFINITY, f64::min);
        if !(dx > 0.0) || !(dy > 0.0) {
            return Err(FusionError::InvalidData(
                "Frame pixel spacing must be positive".to_string(),
            ));
        }

        let bounds = frames
            .iter()
            .map(|f| f.bounds())
            .reduce(|a, b| a.union(&b))
            .unwrap();

        Ok(Grid {
            x: coord_vector(bounds.min_x, bounds.max_x, dx),
            y: coord_vector(bounds.min_y, bounds.max_y, dy),
            dx,
            dy,
        })
    }

    fn resample_frame(&self, frame: &Frame, grid: &Grid) -> ResampledLayer {
        let (rows, cols) = grid.shape();

        // Exterior everywhere to start: dense 0 outside the footprint
        let mut vel = Array2::zeros((rows, cols));
        let mut unc = Array2::zeros((rows, cols));
        let mut comp_e = Array2::zeros((rows, cols));
        let mut comp_n = Array2::zeros((rows, cols));
        let mut comp_u = Array2::zeros((rows, cols));
        let mut footprint = Array2::from_elem((rows, cols), false);

        // Conform coarse/fine unit-vector layers to the velocity lattice
        // before the common interpolation step
        let (unit_e, unit_n, unit_u) = conform_unit_vectors(frame);

        // Restrict interpolation to the grid sub-window covered by the
        // frame's native extent
        let bounds = frame.bounds();
        let (row_range, col_range) = sub_window(grid, &bounds);

        let mut valid_pixels = 0usize;
        for i in row_range.clone() {
            let yq = grid.y[i];
            for j in col_range.clone() {
                let xq = grid.x[j];
                footprint[[i, j]] = true;

                let mask_ok = match &frame.mask {
                    Some(mask) => {
                        let m = bilinear_sample(mask, &frame.x, &frame.y, xq, yq);
                        m.is_finite() && m >= 0.5
                    }
                    None => true,
                };

                let v = bilinear_sample(&frame.vel, &frame.x, &frame.y, xq, yq);
                if !mask_ok || !v.is_finite() {
                    // Masked: inside footprint but invalid
                    vel[[i, j]] = f64::NAN;
                    unc[[i, j]] = f64::NAN;
                    comp_e[[i, j]] = f64::NAN;
                    comp_n[[i, j]] = f64::NAN;
                    comp_u[[i, j]] = f64::NAN;
                    continue;
                }

                vel[[i, j]] = v;
                unc[[i, j]] = bilinear_sample(&frame.unc, &frame.x, &frame.y, xq, yq);
                let e = bilinear_sample(&unit_e, &frame.x, &frame.y, xq, yq);
                let n = bilinear_sample(&unit_n, &frame.x, &frame.y, xq, yq);
                let u = bilinear_sample(&unit_u, &frame.x, &frame.y, xq, yq);
                let (e, n, u) = renormalize(e, n, u);
                comp_e[[i, j]] = e;
                comp_n[[i, j]] = n;
                comp_u[[i, j]] = u;
                valid_pixels += 1;
            }
        }

        ResampledLayer {
            vel,
            unc,
            comp_e,
            comp_n,
            comp_u,
            footprint,
            valid_pixels,
        }
    }
}

impl Default for GridUnifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Resample an external reference field onto the common grid
pub fn resample_reference(reference: &ReferenceField, grid: &Grid) -> ReferenceField {
    let sample_layer = |layer: &VelImage| -> VelImage {
        let (rows, cols) = grid.shape();
        let mut out = Array2::from_elem((rows, cols), f64::NAN);
        for i in 0..rows {
            for j in 0..cols {
                out[[i, j]] =
                    bilinear_sample(layer, &reference.x, &reference.y, grid.x[j], grid.y[i]);
            }
        }
        out
    };

    ReferenceField {
        x: grid.x.clone(),
        y: grid.y.clone(),
        east: sample_layer(&reference.east),
        north: sample_layer(&reference.north),
        unc_east: reference.unc_east.as_ref().map(&sample_layer),
        unc_north: reference.unc_north.as_ref().map(&sample_layer),
    }
}

/// Node coordinates from `min` to at least `max`. When the extent is not an
/// exact multiple of the step the last node overhangs `max` by under one
/// step, so the lattice always covers the full union extent.
fn coord_vector(min: f64, max: f64, step: f64) -> Vec<f64> {
    let n = ((max - min) / step - 1e-9).ceil().max(0.0) as usize + 1;
    (0..n).map(|k| min + k as f64 * step).collect()
}

/// Index ranges of the grid nodes inside the given bounds (inclusive, with
/// a small relative tolerance so boundary nodes survive rounding noise)
fn sub_window(
    grid: &Grid,
    bounds: &BoundingBox,
) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
    let tol_x = 1e-6 * grid.dx;
    let tol_y = 1e-6 * grid.dy;
    let col_start = grid
        .x
        .iter()
        .position(|&x| x >= bounds.min_x - tol_x)
        .unwrap_or(grid.x.len());
    let col_end = grid
        .x
        .iter()
        .rposition(|&x| x <= bounds.max_x + tol_x)
        .map(|p| p + 1)
        .unwrap_or(0);
    let row_start = grid
        .y
        .iter()
        .position(|&y| y >= bounds.min_y - tol_y)
        .unwrap_or(grid.y.len());
    let row_end = grid
        .y
        .iter()
        .rposition(|&y| y <= bounds.max_y + tol_y)
        .map(|p| p + 1)
        .unwrap_or(0);
    (
        row_start..row_end.max(row_start),
        col_start..col_end.max(col_start),
    )
}

/// Bring the unit-vector layers onto the frame's velocity lattice.
///
/// Finer-than-velocity layers are aggregated by cell mean; anything else is
/// resampled bilinearly. Triplets are renormalized to unit length at the
/// final interpolation, not here.
fn conform_unit_vectors(frame: &Frame) -> (VelImage, VelImage, VelImage) {
    match &frame.native_unit_vectors {
        None => (
            frame.comp_e.clone(),
            frame.comp_n.clone(),
            frame.comp_u.clone(),
        ),
        Some(native) => {
            let src_dx = if native.x.len() > 1 {
                native.x[1] - native.x[0]
            } else {
                frame.dx()
            };
            let aggregate = frame.dx() / src_dx >= 1.5;
            (
                conform_component(&native.comp_e, native, frame, aggregate),
                conform_component(&native.comp_n, native, frame, aggregate),
                conform_component(&native.comp_u, native, frame, aggregate),
            )
        }
    }
}

fn conform_component(
    src: &VelImage,
    native: &UnitVectorLayers,
    frame: &Frame,
    aggregate: bool,
) -> VelImage {
    let (rows, cols) = (frame.y.len(), frame.x.len());
    let mut out = Array2::from_elem((rows, cols), f64::NAN);

    if aggregate {
        // Cell-mean aggregation: average every source sample falling in the
        // target cell
        let mut sums = Array2::<f64>::zeros((rows, cols));
        let mut counts = Array2::<usize>::zeros((rows, cols));
        let dx = frame.dx();
        let dy = frame.dy();
        for (si, &sy) in native.y.iter().enumerate() {
            let ti = ((sy - frame.y[0]) / dy).round();
            if ti < 0.0 || ti as usize >= rows {
                continue;
            }
            for (sj, &sx) in native.x.iter().enumerate() {
                let tj = ((sx - frame.x[0]) / dx).round();
                if tj < 0.0 || tj as usize >= cols {
                    continue;
                }
                let value = src[[si, sj]];
                if value.is_finite() {
                    sums[[ti as usize, tj as usize]] += value;
                    counts[[ti as usize, tj as usize]] += 1;
                }
            }
        }
        for i in 0..rows {
            for j in 0..cols {
                if counts[[i, j]] > 0 {
                    out[[i, j]] = sums[[i, j]] / counts[[i, j]] as f64;
                }
            }
        }
    } else {
        for i in 0..rows {
            for j in 0..cols {
                out[[i, j]] = bilinear_sample(src, &native.x, &native.y, frame.x[j], frame.y[i]);
            }
        }
    }
    out
}

fn renormalize(e: f64, n: f64, u: f64) -> (f64, f64, f64) {
    let norm = (e * e + n * n + u * u).sqrt();
    if norm.is_finite() && norm > 0.0 {
        (e / norm, n / norm, u / norm)
    } else {
        (f64::NAN, f64::NAN, f64::NAN)
    }
}
