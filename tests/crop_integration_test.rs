//! Cropping data cubes read from disk

mod common;

use common::{flat, framed, init_logging, write_sji, NULL};
use iriscube::{
    Bounds, CancelToken, CombinedCube, CropConfig, CubeCropper, CubeError, CubeOptions, DataCube,
    FileHub, NoIndexCache, ReaderConfig,
};
use ndarray::Array2;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const EXPECTED: Bounds = Bounds {
    xmin: 11,
    xmax: 49,
    ymin: 6,
    ymax: 34,
};

/// Six 40x60 frames: step 2 is null, step 4 has a shifted footprint
fn frames() -> Vec<Array2<f32>> {
    vec![
        framed(40, 60, 5, 35, 10, 50),
        framed(40, 60, 5, 35, 10, 50),
        flat(40, 60, NULL),
        framed(40, 60, 5, 35, 10, 50),
        framed(40, 60, 5, 35, 25, 50),
        framed(40, 60, 5, 35, 10, 50),
    ]
}

fn open_cube(files: Vec<PathBuf>) -> DataCube {
    let config = ReaderConfig::default();
    let hub = Arc::new(FileHub::new(&config));
    DataCube::open(
        files,
        CubeOptions::default().with_keep_null(true),
        hub,
        &config,
    )
    .expect("Failed to open data cube")
    .with_index_cache(Arc::new(NoIndexCache))
}

/// Cropping narrows every retained read and removes bad steps
#[test]
fn test_crop_round_trip() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let mut cube = open_cube(vec![write_sji(dir.path(), "sji.irc", &frames())]);
    assert_eq!(cube.n_steps().unwrap(), 6);

    let fit = cube
        .crop(true, true)
        .expect("Failed to crop")
        .expect("cube was not cropped yet");
    assert_eq!(fit.bounds, EXPECTED);
    assert_eq!(fit.null_steps, vec![2]);
    assert_eq!(fit.corrupt_steps, vec![4]);

    assert!(cube.is_cropped());
    assert_eq!(cube.bounds(), Some(EXPECTED));
    assert_eq!(cube.shape().unwrap(), (4, 28, 38));
    for step in 0..4 {
        let image = cube.get_image_step(step, None, false).unwrap();
        assert_eq!(image.dim(), (EXPECTED.ymax - EXPECTED.ymin, EXPECTED.xmax - EXPECTED.xmin));
        assert!(image.iter().all(|&v| v > NULL));
    }
    assert!(cube.get_image_step(4, None, false).unwrap_err().is_range_error());

    // a second crop is a no-op
    assert!(cube.crop(true, true).unwrap().is_none());
    assert_eq!(cube.n_steps().unwrap(), 4);
}

/// The common rectangle lies inside every inlier's own rectangle
#[test]
fn test_aggregation_soundness() {
    let dir = TempDir::new().unwrap();
    let mut varied = frames();
    // one pixel of disagreement stays below the outlier threshold
    varied[1] = framed(40, 60, 5, 35, 10, 49);
    varied[3] = framed(40, 60, 5, 35, 11, 50);
    let cube = open_cube(vec![write_sji(dir.path(), "sji.irc", &varied)]);

    let fit = CubeCropper::default().fit(&cube).expect("Failed to fit cube");
    assert_eq!(fit.corrupt_steps, vec![4]);
    assert_eq!(fit.bounds, Bounds::new(12, 48, 6, 34));
    assert!(fit.null_steps.iter().all(|s| !fit.corrupt_steps.contains(s)));
    for step in fit.inlier_steps() {
        let own = fit.step_bounds[step];
        assert!(
            own.contains(&fit.bounds),
            "step {} bounds {:?} do not contain {:?}",
            step,
            own,
            fit.bounds
        );
    }
}

/// Without removal bad steps stay but the rectangle is still applied
#[test]
fn test_crop_without_removal() {
    let dir = TempDir::new().unwrap();
    let mut cube = open_cube(vec![write_sji(dir.path(), "sji.irc", &frames())]);
    cube.crop(false, true).unwrap();
    assert_eq!(cube.shape().unwrap(), (6, 28, 38));

    cube.reset_bounds();
    assert!(!cube.is_cropped());
    assert_eq!(cube.shape().unwrap(), (6, 40, 60));
}

/// A cancelled crop leaves the cube as it was
#[test]
fn test_cancelled_crop_is_not_applied() {
    let dir = TempDir::new().unwrap();
    let mut cube = open_cube(vec![write_sji(dir.path(), "sji.irc", &frames())]);
    let token = CancelToken::new();
    token.cancel();

    let result = cube.crop_with(&CubeCropper::default(), true, Some(&token));
    assert!(matches!(result, Err(CubeError::Cancelled)));
    assert!(!cube.is_cropped());
    assert_eq!(cube.n_steps().unwrap(), 6);
}

/// Loose thresholds keep the shifted frame
#[test]
fn test_configurable_outlier_threshold() {
    let dir = TempDir::new().unwrap();
    let cube = open_cube(vec![write_sji(dir.path(), "sji.irc", &frames())]);
    let cropper = CubeCropper::new(CropConfig::default().with_outlier_threshold(0.5));
    let fit = cropper.fit(&cube).unwrap();
    assert!(fit.corrupt_steps.is_empty());
    assert_eq!(fit.bounds.xmin, 26);
}

/// Index filtering and cropping agree on a configured missing-data value
#[test]
fn test_custom_sentinel_drives_crop() {
    let dir = TempDir::new().unwrap();
    let missing = -150.0;
    let mut images: Vec<Array2<f32>> = (0..4)
        .map(|_| framed(40, 60, 5, 35, 10, 50).mapv(|v| if v == NULL { missing } else { v }))
        .collect();
    images.insert(2, flat(40, 60, missing));
    let file = write_sji(dir.path(), "sji.irc", &images);

    let config = ReaderConfig::default().with_sentinel(-100.0);
    let hub = Arc::new(FileHub::new(&config));
    let mut cube = DataCube::open(vec![file], CubeOptions::default(), hub, &config)
        .expect("Failed to open data cube")
        .with_index_cache(Arc::new(NoIndexCache));
    assert_eq!(cube.n_steps().unwrap(), 4);

    // a cropper with another missing-data value would disagree with the index
    assert!(matches!(
        cube.crop_with(&CubeCropper::default(), true, None),
        Err(CubeError::Configuration(_))
    ));
    assert!(!cube.is_cropped());

    let fit = cube.crop(true, true).unwrap().expect("not cropped yet");
    assert_eq!(fit.bounds, EXPECTED);
    assert!(fit.null_steps.is_empty());
    assert!(fit.corrupt_steps.is_empty());
    assert_eq!(cube.shape().unwrap(), (4, 28, 38));
}

/// Combined cubes crop all members with one rectangle
#[test]
fn test_combined_crop() {
    let dir = TempDir::new().unwrap();
    let config = ReaderConfig::default();
    let hub = Arc::new(FileHub::new(&config));
    let all = frames();
    let members = [&all[..3], &all[3..]]
        .iter()
        .enumerate()
        .map(|(m, part)| {
            let file = write_sji(dir.path(), &format!("m{}.irc", m), part);
            DataCube::open(
                vec![file],
                CubeOptions::default().with_keep_null(true),
                Arc::clone(&hub),
                &config,
            )
            .unwrap()
            .with_index_cache(Arc::new(NoIndexCache))
        })
        .collect();
    let mut cube = CombinedCube::new(members).unwrap();

    let fit = cube.crop(true, true).unwrap().expect("not cropped yet");
    assert_eq!(fit.removed_steps(), vec![2, 4]);
    assert_eq!(cube.member_step_counts().unwrap(), vec![2, 2]);
    assert_eq!(cube.shape().unwrap(), (4, 28, 38));
    assert!(cube.members().iter().all(|m| m.bounds() == Some(EXPECTED)));
}
