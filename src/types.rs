use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

/// Real-valued velocity data (mm/yr or any consistent unit)
pub type VelReal = f64;

/// 2D velocity/uncertainty data array (row = y, col = x)
pub type VelImage = Array2<VelReal>;

/// 3D stacked data for multiple frames/tracks (layer x row x col)
pub type VelCube = Array3<VelReal>;

/// Length of the track identifier prefix in frame names (e.g. "087D" in
/// "087D_04904_121209")
pub const TRACK_ID_LEN: usize = 4;

/// Satellite pass direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PassDirection {
    Ascending,
    Descending,
}

impl std::fmt::Display for PassDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassDirection::Ascending => write!(f, "ascending"),
            PassDirection::Descending => write!(f, "descending"),
        }
    }
}

/// Parse the track identifier and pass direction from a frame name.
///
/// The track id is a fixed-length name prefix whose last character encodes
/// the pass direction ('A' or 'D').
pub fn parse_track_id(name: &str) -> FusionResult<(String, PassDirection)> {
    if name.len() < TRACK_ID_LEN {
        return Err(FusionError::InvalidData(format!(
            "Frame name '{}' is shorter than the {}-character track prefix",
            name, TRACK_ID_LEN
        )));
    }
    let track = &name[..TRACK_ID_LEN];
    let pass = match track.chars().last() {
        Some('A') | Some('a') => PassDirection::Ascending,
        Some('D') | Some('d') => PassDirection::Descending,
        _ => {
            return Err(FusionError::InvalidData(format!(
                "Track id '{}' does not end in a pass-direction letter (A/D)",
                track
            )))
        }
    };
    Ok((track.to_string(), pass))
}

/// Geospatial bounding box in grid coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Smallest box containing both inputs
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            max_x: self.max_x.max(other.max_x),
            min_y: self.min_y.min(other.min_y),
            max_y: self.max_y.max(other.max_y),
        }
    }
}

/// Unit-vector layers supplied on their own (usually finer) native lattice
#[derive(Debug, Clone)]
pub struct UnitVectorLayers {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub comp_e: VelImage,
    pub comp_n: VelImage,
    pub comp_u: VelImage,
}

/// One acquisition: LOS velocity, uncertainty and viewing geometry on the
/// frame's native lattice. Immutable input to the grid unifier.
#[derive(Debug, Clone)]
pub struct Frame {
    pub name: String,
    pub track: String,
    pub pass: PassDirection,
    /// Native x coordinates (monotone increasing, one per column)
    pub x: Vec<f64>,
    /// Native y coordinates (monotone increasing, one per row)
    pub y: Vec<f64>,
    pub vel: VelImage,
    pub unc: VelImage,
    pub comp_e: VelImage,
    pub comp_n: VelImage,
    pub comp_u: VelImage,
    /// Optional validity mask (values >= 0.5 are valid)
    pub mask: Option<VelImage>,
    /// Unit-vector layers on a different native lattice, when not already
    /// on the velocity lattice
    pub native_unit_vectors: Option<UnitVectorLayers>,
}

impl Frame {
    /// Build a frame, deriving track id and pass direction from the name.
    pub fn new(
        name: impl Into<String>,
        x: Vec<f64>,
        y: Vec<f64>,
        vel: VelImage,
        unc: VelImage,
        comp_e: VelImage,
        comp_n: VelImage,
        comp_u: VelImage,
    ) -> FusionResult<Self> {
        let name = name.into();
        let (track, pass) = parse_track_id(&name)?;
        let shape = (y.len(), x.len());
        for (label, arr) in [
            ("velocity", &vel),
            ("uncertainty", &unc),
            ("east unit-vector", &comp_e),
            ("north unit-vector", &comp_n),
            ("up unit-vector", &comp_u),
        ] {
            if arr.dim() != shape {
                return Err(FusionError::InvalidData(format!(
                    "Frame '{}': {} layer shape {:?} does not match lattice {:?}",
                    name,
                    label,
                    arr.dim(),
                    shape
                )));
            }
        }
        check_monotone(&x, &name, "x")?;
        check_monotone(&y, &name, "y")?;
        Ok(Frame {
            name,
            track,
            pass,
            x,
            y,
            vel,
            unc,
            comp_e,
            comp_n,
            comp_u,
            mask: None,
            native_unit_vectors: None,
        })
    }

    pub fn with_mask(mut self, mask: VelImage) -> FusionResult<Self> {
        if mask.dim() != (self.y.len(), self.x.len()) {
            return Err(FusionError::InvalidData(format!(
                "Frame '{}': mask shape {:?} does not match lattice",
                self.name,
                mask.dim()
            )));
        }
        self.mask = Some(mask);
        Ok(self)
    }

    /// Attach unit-vector layers on their own native lattice; the grid
    /// unifier conforms them to the velocity lattice before resampling.
    pub fn with_native_unit_vectors(mut self, layers: UnitVectorLayers) -> Self {
        self.native_unit_vectors = Some(layers);
        self
    }

    /// Native pixel spacing, from the coordinate vectors
    pub fn dx(&self) -> f64 {
        if self.x.len() > 1 {
            self.x[1] - self.x[0]
        } else {
            1.0
        }
    }

    pub fn dy(&self) -> f64 {
        if self.y.len() > 1 {
            self.y[1] - self.y[0]
        } else {
            1.0
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox {
            min_x: self.x[0],
            max_x: self.x[self.x.len() - 1],
            min_y: self.y[0],
            max_y: self.y[self.y.len() - 1],
        }
    }
}

fn check_monotone(coords: &[f64], name: &str, axis: &str) -> FusionResult<()> {
    if coords.is_empty() {
        return Err(FusionError::InvalidData(format!(
            "Frame '{}': empty {} coordinate vector",
            name, axis
        )));
    }
    if coords.windows(2).any(|w| w[1] <= w[0]) {
        return Err(FusionError::InvalidData(format!(
            "Frame '{}': {} coordinates are not monotone increasing",
            name, axis
        )));
    }
    Ok(())
}

/// Common output lattice shared by all stacked layers
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub dx: f64,
    pub dy: f64,
}

impl Grid {
    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.y.len(), self.x.len())
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox {
            min_x: self.x[0],
            max_x: self.x[self.x.len() - 1],
            min_y: self.y[0],
            max_y: self.y[self.y.len() - 1],
        }
    }
}

/// State of one stacked cell.
///
/// Exterior (outside the layer's original footprint) and Masked (inside the
/// footprint but invalid) are distinct and must never be conflated; the
/// dense encoding (0 / NaN) exists only at the storage boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellState {
    Exterior,
    Masked,
    Value(VelReal),
}

impl CellState {
    /// Dense storage encoding: Exterior -> 0, Masked -> NaN
    pub fn to_dense(self) -> VelReal {
        match self {
            CellState::Exterior => 0.0,
            CellState::Masked => VelReal::NAN,
            CellState::Value(v) => v,
        }
    }

    pub fn from_dense(value: VelReal, in_footprint: bool) -> CellState {
        if !in_footprint {
            CellState::Exterior
        } else if value.is_nan() {
            CellState::Masked
        } else {
            CellState::Value(value)
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, CellState::Value(_))
    }
}

/// Stacked per-layer rasters on the common grid.
///
/// One layer per input frame (after unification) or per merged track segment
/// (after along-track merging). All cubes share the grid shape.
#[derive(Debug, Clone)]
pub struct VelocityStack {
    pub grid: Grid,
    /// Layer identifiers (frame names, or track/segment ids after merging)
    pub ids: Vec<String>,
    /// Pass direction per layer
    pub passes: Vec<PassDirection>,
    pub vel: VelCube,
    pub unc: VelCube,
    pub comp_e: VelCube,
    pub comp_n: VelCube,
    pub comp_u: VelCube,
    /// True where the cell lies inside the layer's original footprint
    pub footprint: Array3<bool>,
}

impl VelocityStack {
    /// Allocate an all-Exterior stack for `n_layers` layers.
    pub fn zeros(grid: Grid, n_layers: usize) -> Self {
        let (rows, cols) = grid.shape();
        let dim = (n_layers, rows, cols);
        VelocityStack {
            grid,
            ids: Vec::with_capacity(n_layers),
            passes: Vec::with_capacity(n_layers),
            vel: Array3::zeros(dim),
            unc: Array3::zeros(dim),
            comp_e: Array3::zeros(dim),
            comp_n: Array3::zeros(dim),
            comp_u: Array3::zeros(dim),
            footprint: Array3::from_elem(dim, false),
        }
    }

    pub fn n_layers(&self) -> usize {
        self.vel.dim().0
    }

    /// Three-state view of one velocity cell
    pub fn state(&self, layer: usize, row: usize, col: usize) -> CellState {
        CellState::from_dense(
            self.vel[[layer, row, col]],
            self.footprint[[layer, row, col]],
        )
    }

    /// True where the cell carries a finite velocity inside the footprint
    pub fn is_valid(&self, layer: usize, row: usize, col: usize) -> bool {
        self.footprint[[layer, row, col]] && self.vel[[layer, row, col]].is_finite()
    }

    pub fn valid_count(&self, layer: usize) -> usize {
        let (_, rows, cols) = self.vel.dim();
        let mut count = 0;
        for r in 0..rows {
            for c in 0..cols {
                if self.is_valid(layer, r, c) {
                    count += 1;
                }
            }
        }
        count
    }
}

/// Externally supplied ground-truth velocity field (e.g. interpolated GNSS),
/// on its own native lattice until resampled to the common grid.
#[derive(Debug, Clone)]
pub struct ReferenceField {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub east: VelImage,
    pub north: VelImage,
    pub unc_east: Option<VelImage>,
    pub unc_north: Option<VelImage>,
}

/// Terminal per-pixel decomposition output
#[derive(Debug, Clone)]
pub struct DecompositionResult {
    pub east: VelImage,
    pub up: VelImage,
    pub north: Option<VelImage>,
    pub var_east: VelImage,
    pub var_up: VelImage,
    pub var_north: Option<VelImage>,
    /// Condition number of the normal matrix exceeded the threshold
    pub ill_conditioned: Array2<bool>,
    /// A parameter variance exceeded the threshold
    pub high_variance: Array2<bool>,
    pub solved_pixels: usize,
}

/// Error types for velocity fusion
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Result type for fusion operations
pub type FusionResult<T> = Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_track_id_parsing() {
        let (track, pass) = parse_track_id("087D_04904_121209").unwrap();
        assert_eq!(track, "087D");
        assert_eq!(pass, PassDirection::Descending);

        let (track, pass) = parse_track_id("116A_05207_131313").unwrap();
        assert_eq!(track, "116A");
        assert_eq!(pass, PassDirection::Ascending);

        assert!(parse_track_id("08").is_err());
        assert!(parse_track_id("0879_04904").is_err());
    }

    #[test]
    fn test_cell_state_round_trip() {
        assert_eq!(CellState::from_dense(0.0, false), CellState::Exterior);
        assert_eq!(CellState::from_dense(f64::NAN, true), CellState::Masked);
        assert_eq!(CellState::from_dense(1.5, true), CellState::Value(1.5));
        // A genuine zero inside the footprint stays a value
        assert_eq!(CellState::from_dense(0.0, true), CellState::Value(0.0));

        assert_eq!(CellState::Exterior.to_dense(), 0.0);
        assert!(CellState::Masked.to_dense().is_nan());
    }

    #[test]
    fn test_frame_shape_validation() {
        let x = vec![0.0, 1.0, 2.0];
        let y = vec![0.0, 1.0];
        let good = Array2::zeros((2, 3));
        let bad = Array2::zeros((3, 2));
        assert!(Frame::new(
            "021A_test",
            x.clone(),
            y.clone(),
            good.clone(),
            good.clone(),
            good.clone(),
            good.clone(),
            bad
        )
        .is_err());
        let frame = Frame::new(
            "021A_test",
            x,
            y,
            good.clone(),
            good.clone(),
            good.clone(),
            good.clone(),
            good,
        )
        .unwrap();
        assert_eq!(frame.track, "021A");
        assert_eq!(frame.dx(), 1.0);
    }
}
