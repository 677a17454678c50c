use ndarray::Array2;
use velfuse::core::decompose::NorthTreatment;
use velfuse::{
    CellState, DecompositionMode, Frame, FusionConfig, FusionPipeline, MergeMethod, RefMethod,
    ReferenceField,
};

/// Synthetic motion field used by all frames: a constant (east, north, up)
const MOTION: (f64, f64, f64) = (4.0, 0.0, -2.0);

/// Build a frame with uniform viewing geometry observing MOTION noise-free,
/// covering x in [x0, x0+cols-1] and y in [y0, y0+rows-1], plus an optional
/// scalar reference-frame bias.
fn synthetic_frame(name: &str, x0: f64, y0: f64, cols: usize, rows: usize, e: f64, bias: f64) -> Frame {
    let n = 0.05;
    let u = (1.0 - e * e - n * n).sqrt();
    let los = e * MOTION.0 + n * MOTION.1 + u * MOTION.2;
    let x: Vec<f64> = (0..cols).map(|k| x0 + k as f64).collect();
    let y: Vec<f64> = (0..rows).map(|k| y0 + k as f64).collect();
    Frame::new(
        name,
        x,
        y,
        Array2::from_elem((rows, cols), los + bias),
        Array2::from_elem((rows, cols), 1.0),
        Array2::from_elem((rows, cols), e),
        Array2::from_elem((rows, cols), n),
        Array2::from_elem((rows, cols), u),
    )
    .expect("valid synthetic frame")
}

/// Two tracks (one ascending, one descending), each split into two
/// overlapping frames; the later frame of each track carries an offset the
/// merge step must remove.
fn two_track_scene() -> Vec<Frame> {
    vec![
        synthetic_frame("010A_south", 0.0, 0.0, 8, 6, -0.62, 0.0),
        synthetic_frame("010A_north", 0.0, 4.0, 8, 6, -0.62, 2.0),
        // Descending chains run north to south, so the southern frame is
        // the later, offset-corrected one
        synthetic_frame("044D_south", 0.0, 0.0, 8, 6, 0.58, -1.0),
        synthetic_frame("044D_north", 0.0, 4.0, 8, 6, 0.58, 0.0),
    ]
}

fn zero_reference(x_max: f64, y_max: f64) -> ReferenceField {
    let x: Vec<f64> = (0..=(x_max as usize)).map(|k| k as f64).collect();
    let y: Vec<f64> = (0..=(y_max as usize)).map(|k| k as f64).collect();
    let shape = (y.len(), x.len());
    ReferenceField {
        x,
        y,
        east: Array2::zeros(shape),
        north: Array2::zeros(shape),
        unc_east: None,
        unc_north: None,
    }
}

#[test]
fn test_unified_layers_share_grid_shape_and_bounds() {
    let config = FusionConfig::default();
    let pipeline = FusionPipeline::new(config);
    let merged = pipeline.unify_and_merge(&two_track_scene()).unwrap();

    let (rows, cols) = merged.grid.shape();
    assert_eq!(merged.vel.dim(), (2, rows, cols));
    assert_eq!(merged.unc.dim(), (2, rows, cols));
    assert_eq!(merged.comp_e.dim(), (2, rows, cols));
    assert_eq!(merged.footprint.dim(), (2, rows, cols));

    let bounds = merged.grid.bounds();
    assert_eq!(bounds.min_x, 0.0);
    assert_eq!(bounds.max_x, 7.0);
    assert_eq!(bounds.min_y, 0.0);
    assert_eq!(bounds.max_y, 9.0);
    assert_eq!(merged.ids, vec!["010A".to_string(), "044D".to_string()]);
}

#[test]
fn test_exterior_and_masked_stay_distinct_through_merge() {
    let mut frames = two_track_scene();
    // Mask a pixel inside the first frame's footprint
    frames[0].vel[[1, 1]] = f64::NAN;
    // Shrink the descending track so part of the grid is outside it
    frames.truncate(3);
    frames[2] = synthetic_frame("044D_small", 0.0, 0.0, 4, 4, 0.58, 0.0);

    let pipeline = FusionPipeline::new(FusionConfig::default());
    let merged = pipeline.unify_and_merge(&frames).unwrap();

    let desc = merged.ids.iter().position(|id| id == "044D").unwrap();
    let (rows, cols) = merged.grid.shape();
    // Far corner of the grid is outside the shrunken descending track
    assert_eq!(merged.state(desc, rows - 1, cols - 1), CellState::Exterior);

    let asc = merged.ids.iter().position(|id| id == "010A").unwrap();
    // The masked pixel is covered only by the first (southern) frame, so it
    // stays masked in the merged ascending layer
    assert_eq!(merged.state(asc, 1, 1), CellState::Masked);
    assert!(matches!(merged.state(asc, 0, 0), CellState::Value(_)));
}

#[test]
fn test_full_run_recovers_synthetic_motion() {
    let config = FusionConfig {
        merge_method: MergeMethod::Mean,
        ref_method: RefMethod::Polynomial,
        ref_poly_order: Some(1),
        decomposition_mode: DecompositionMode::Direct(NorthTreatment::SubtractReference),
        ..FusionConfig::default()
    };
    let pipeline = FusionPipeline::new(config);
    let reference = zero_reference(7.0, 9.0);

    // With a zero reference field the polynomial tie removes the LOS-level
    // bias of each track; merge offsets were already removed relative to the
    // unbiased first frame, so the decomposition sees consistent LOS fields.
    // The zero-reference tie also removes each track's projection of the
    // true motion, so this run checks plumbing, not absolute recovery:
    // decompose without referencing instead for the round-trip check.
    let products = pipeline.run(&two_track_scene(), Some(&reference), None).unwrap();
    assert!(products.decomposition.solved_pixels > 0);

    // The tie's correction surfaces come back as a diagnostic, one per
    // merged layer, finite where the tie actually corrected data
    let surfaces = products.correction_surfaces.expect("tie ran");
    assert_eq!(surfaces.len(), 2);
    assert!(surfaces.iter().all(|s| s.iter().any(|v| v.is_finite())));

    // Round-trip check without a reference tie
    let config = FusionConfig {
        decomposition_mode: DecompositionMode::Direct(NorthTreatment::AssumeZero),
        ..FusionConfig::default()
    };
    let products = FusionPipeline::new(config)
        .run(&two_track_scene(), None, None)
        .unwrap();
    assert!(products.correction_surfaces.is_none());
    let result = products.decomposition;
    let (rows, cols) = result.east.dim();
    let mut checked = 0;
    for r in 0..rows {
        for c in 0..cols {
            if result.east[[r, c]].is_finite() {
                // North motion is zero in the synthetic scene, so the
                // two-component solve is exact up to the small n-component
                assert!((result.east[[r, c]] - MOTION.0).abs() < 0.1);
                assert!((result.up[[r, c]] - MOTION.2).abs() < 0.1);
                checked += 1;
            }
        }
    }
    assert!(checked > 0, "no decomposed pixels to check");
}

#[test]
fn test_external_bias_subtraction_between_merge_and_tie() {
    let pipeline = FusionPipeline::new(FusionConfig::default());
    let mut merged = pipeline.unify_and_merge(&two_track_scene()).unwrap();
    let (rows, cols) = merged.grid.shape();

    let before = merged.vel[[0, 2, 2]];
    let bias = vec![Array2::from_elem((rows, cols), 0.7), Array2::zeros((rows, cols))];
    velfuse::subtract_bias(&mut merged, &bias).unwrap();
    assert!((merged.vel[[0, 2, 2]] - (before - 0.7)).abs() < 1e-12);

    // One bias field per layer is required
    let wrong = vec![Array2::zeros((rows, cols))];
    assert!(velfuse::subtract_bias(&mut merged, &wrong).is_err());
}

#[test]
fn test_reference_tie_without_reference_is_configuration_error() {
    let config = FusionConfig {
        ref_method: RefMethod::Polynomial,
        ref_poly_order: Some(1),
        ..FusionConfig::default()
    };
    let result = FusionPipeline::new(config).run(&two_track_scene(), None, None);
    assert!(result.is_err());
}

#[test]
fn test_cross_track_diagnostic_runs_on_merged_stack() {
    let pipeline = FusionPipeline::new(FusionConfig::default());
    let merged = pipeline.unify_and_merge(&two_track_scene()).unwrap();
    let diagnostic = pipeline.cross_track_diagnostic(&merged).unwrap();
    assert!(diagnostic.ascending.is_some());
    assert!(diagnostic.descending.is_some());
    assert!(diagnostic.east_up.is_some());
}
