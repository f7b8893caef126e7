//! Cropping pipeline
//!
//! [`ImageCropper`] finds the valid rectangle of one image by sliding lines
//! inward from each edge until the count of valid pixels stops growing.
//! [`CubeCropper`] runs it over every step of a cube, rejects null, corrupt
//! and outlier images and derives one rectangle valid for every retained step.

use crate::config::CropConfig;
use crate::error::{CubeError, Result};
use crate::types::{Bounds, Modality, ObservationMode};
use crate::utils::{check_cancelled, CancelToken};
use log::{info, warn};
use ndarray::{s, Array2, ArrayView1, ArrayView2};
use std::collections::BTreeSet;

/// Read access the cube cropper needs
pub trait ImageSource {
    fn n_steps(&self) -> Result<usize>;

    /// Image at `step` in raw data numbers
    fn read_image(&self, step: usize) -> Result<Array2<f32>>;

    fn modality(&self) -> Modality;

    fn observation_mode(&self) -> ObservationMode;
}

/// A cube that can narrow its frame and drop steps
pub trait CroppableCube: ImageSource {
    fn is_cropped(&self) -> bool;

    /// Apply a fit atomically: either bounds and removals both land or neither does
    fn apply_crop(&mut self, fit: &CubeFit, remove_bad: bool) -> Result<()>;
}

/// Index of the first line, scanning inward, at which the valid-pixel count
/// stops increasing
fn plateau(counts: impl Iterator<Item = usize>) -> Option<usize> {
    let mut previous = 0;
    for (i, count) in counts.enumerate() {
        if i > 0 && count > 0 && count <= previous {
            return Some(i);
        }
        previous = count;
    }
    None
}

fn count_valid(line: ArrayView1<'_, f32>, sentinel: f32) -> usize {
    line.iter().filter(|&&v| v > sentinel).count()
}

fn missing_fraction<'a>(values: impl Iterator<Item = &'a f32>, sentinel: f32) -> f64 {
    let (mut missing, mut total) = (0usize, 0usize);
    for &v in values {
        total += 1;
        if v <= sentinel {
            missing += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        missing as f64 / total as f64
    }
}

/// Bounds detector for a single image
#[derive(Debug, Clone, Default)]
pub struct ImageCropper {
    config: CropConfig,
}

impl ImageCropper {
    pub fn new(config: CropConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CropConfig {
        &self.config
    }

    /// Find the valid rectangle of a `[y, x]` image
    pub fn fit(&self, image: ArrayView2<'_, f32>) -> Result<Bounds> {
        let sentinel = self.config.sentinel;
        let offset = self.config.offset;
        let (height, width) = image.dim();

        if image.iter().all(|&v| v <= sentinel) {
            return Err(CubeError::NullImage);
        }

        let row_counts: Vec<usize> = image.rows().into_iter().map(|l| count_valid(l, sentinel)).collect();
        let col_counts: Vec<usize> = image
            .columns()
            .into_iter()
            .map(|l| count_valid(l, sentinel))
            .collect();

        let lower = |counts: &[usize], extent: usize| {
            plateau(counts.iter().copied()).unwrap_or(extent) + offset
        };
        let upper = |counts: &[usize], extent: usize| {
            plateau(counts.iter().rev().copied())
                .map_or(extent, |i| extent - i)
                .saturating_sub(offset)
        };

        let bounds = Bounds::new(
            lower(&col_counts, width),
            upper(&col_counts, width),
            lower(&row_counts, height),
            upper(&row_counts, height),
        );
        if bounds.xmin >= bounds.xmax || bounds.ymin >= bounds.ymax {
            return Err(CubeError::CorruptImage(format!(
                "no valid region left ({:?})",
                bounds.as_array()
            )));
        }

        if self.config.check_coverage {
            self.check_coverage(image, &bounds)?;
        }
        Ok(bounds)
    }

    fn check_coverage(&self, image: ArrayView2<'_, f32>, b: &Bounds) -> Result<()> {
        let sentinel = self.config.sentinel;
        let threshold = self.config.coverage_threshold;
        let (height, width) = image.dim();

        let interior = missing_fraction(image.slice(s![b.ymin..b.ymax, b.xmin..b.xmax]).iter(), sentinel);
        if interior > threshold {
            return Err(CubeError::CorruptImage(format!(
                "{:.1}% of the cropped image is missing",
                interior * 100.0
            )));
        }

        let last_row = b.ymax.min(height - 1);
        let last_col = b.xmax.min(width - 1);
        let borders = [
            missing_fraction(image.slice(s![b.ymin..b.ymax, b.xmin]).iter(), sentinel),
            missing_fraction(image.slice(s![b.ymin..b.ymax, last_col]).iter(), sentinel),
            missing_fraction(image.slice(s![b.ymin, b.xmin..b.xmax]).iter(), sentinel),
            missing_fraction(image.slice(s![last_row, b.xmin..b.xmax]).iter(), sentinel),
        ];
        if let Some(worst) = borders.iter().copied().find(|&f| f > threshold) {
            return Err(CubeError::CorruptImage(format!(
                "{:.1}% of a border line is missing",
                worst * 100.0
            )));
        }
        Ok(())
    }

    /// Cut `bounds` out of `image`
    pub fn transform(&self, image: ArrayView2<'_, f32>, bounds: &Bounds) -> Result<Array2<f32>> {
        let (height, width) = image.dim();
        bounds.validate(height, width)?;
        Ok(image
            .slice(s![bounds.ymin..bounds.ymax, bounds.xmin..bounds.xmax])
            .to_owned())
    }
}

/// Result of fitting a whole cube
#[derive(Debug, Clone, PartialEq)]
pub struct CubeFit {
    /// Common rectangle valid for every inlier step
    pub bounds: Bounds,
    pub null_steps: Vec<usize>,
    /// Corrupt and outlier steps, never containing a null step
    pub corrupt_steps: Vec<usize>,
    /// Per-step bounds; all zero for null and corrupt steps
    pub step_bounds: Vec<Bounds>,
}

impl CubeFit {
    /// Null and corrupt steps, sorted
    pub fn removed_steps(&self) -> Vec<usize> {
        self.null_steps
            .iter()
            .chain(&self.corrupt_steps)
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Steps that are neither null nor corrupt
    pub fn inlier_steps(&self) -> Vec<usize> {
        let removed: BTreeSet<usize> = self.removed_steps().into_iter().collect();
        (0..self.step_bounds.len())
            .filter(|s| !removed.contains(s))
            .collect()
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Aggregates per-image bounds across a cube
#[derive(Debug, Clone, Default)]
pub struct CubeCropper {
    cropper: ImageCropper,
}

impl CubeCropper {
    pub fn new(config: CropConfig) -> Self {
        Self {
            cropper: ImageCropper::new(config),
        }
    }

    pub fn config(&self) -> &CropConfig {
        self.cropper.config()
    }

    /// Fail unless this cropper treats `sentinel` as missing data
    pub fn check_sentinel(&self, sentinel: f32) -> Result<()> {
        if self.config().sentinel != sentinel {
            return Err(CubeError::Configuration(format!(
                "cropper treats {} as missing data, the cube uses {}",
                self.config().sentinel,
                sentinel
            )));
        }
        Ok(())
    }

    pub fn fit(&self, cube: &dyn ImageSource) -> Result<CubeFit> {
        self.fit_with(cube, None)
    }

    /// Fit every step of `cube`, checking `cancel` between steps
    pub fn fit_with(&self, cube: &dyn ImageSource, cancel: Option<&CancelToken>) -> Result<CubeFit> {
        if cube.modality() == Modality::Sji && cube.observation_mode() != ObservationMode::SitAndStare {
            return Err(CubeError::Configuration(
                "only sit-and-stare slit-jaw observations can be cropped as a cube".to_string(),
            ));
        }

        let n_steps = cube.n_steps()?;
        let mut step_bounds = Vec::with_capacity(n_steps);
        let mut fitted = Vec::with_capacity(n_steps);
        let mut null_steps = Vec::new();
        let mut corrupt: BTreeSet<usize> = BTreeSet::new();
        // fixed by the first image read
        let mut frame: Option<(usize, usize)> = None;

        for step in 0..n_steps {
            check_cancelled(cancel)?;
            let image = cube.read_image(step)?;
            let expected = *frame.get_or_insert(image.dim());
            if image.dim() != expected {
                warn!(
                    "image {} is {:?}, the cube frame is {:?}; treating it as corrupt",
                    step,
                    image.dim(),
                    expected
                );
                step_bounds.push(Bounds::default());
                corrupt.insert(step);
                continue;
            }
            match self.cropper.fit(image.view()) {
                Ok(bounds) => {
                    step_bounds.push(bounds);
                    fitted.push(step);
                }
                Err(CubeError::NullImage) => {
                    step_bounds.push(Bounds::default());
                    null_steps.push(step);
                }
                Err(CubeError::CorruptImage(_)) => {
                    step_bounds.push(Bounds::default());
                    corrupt.insert(step);
                }
                Err(e) => return Err(e),
            }
        }

        if fitted.is_empty() {
            return Err(CubeError::EmptyCube(format!(
                "none of {} images could be cropped",
                n_steps
            )));
        }

        let medians: Vec<f64> = (0..4)
            .map(|k| {
                let mut column: Vec<f64> = fitted
                    .iter()
                    .map(|&s| step_bounds[s].as_array()[k] as f64)
                    .collect();
                median(&mut column)
            })
            .collect();
        let (height, width) = frame.map_or((1.0, 1.0), |(h, w)| (h as f64, w as f64));
        let scale = [width, width, height, height];

        let mut inliers = Vec::with_capacity(fitted.len());
        for &step in &fitted {
            let b = step_bounds[step].as_array();
            let score = (0..4)
                .map(|k| (b[k] as f64 - medians[k]).abs() / scale[k])
                .fold(0.0, f64::max);
            if score > self.config().outlier_threshold {
                corrupt.insert(step);
            } else {
                inliers.push(step);
            }
        }
        let outliers = fitted.len() - inliers.len();
        if outliers > 0 {
            warn!(
                "{} of {} images deviate from the median bounds and are treated as corrupt",
                outliers, n_steps
            );
        }

        if inliers.is_empty() {
            return Err(CubeError::EmptyCube("no inlier images left".to_string()));
        }
        let bounds = Bounds::new(
            inliers.iter().map(|&s| step_bounds[s].xmin).max().unwrap_or(0),
            inliers.iter().map(|&s| step_bounds[s].xmax).min().unwrap_or(0),
            inliers.iter().map(|&s| step_bounds[s].ymin).max().unwrap_or(0),
            inliers.iter().map(|&s| step_bounds[s].ymax).min().unwrap_or(0),
        );
        if bounds.xmin >= bounds.xmax || bounds.ymin >= bounds.ymax {
            return Err(CubeError::InvalidBounds(format!(
                "inlier images share no common region ({:?})",
                bounds.as_array()
            )));
        }

        for step in &null_steps {
            corrupt.remove(step);
        }
        Ok(CubeFit {
            bounds,
            null_steps,
            corrupt_steps: corrupt.into_iter().collect(),
            step_bounds,
        })
    }

    /// Fit `cube` and apply the result; `Ok(None)` if it was already cropped
    ///
    /// The cube is left untouched if fitting fails or is cancelled.
    pub fn fit_transform<C: CroppableCube>(
        &self,
        cube: &mut C,
        remove_bad: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<CubeFit>> {
        if cube.is_cropped() {
            info!("data cube has already been cropped, doing nothing");
            return Ok(None);
        }
        let fit = self.fit_with(&*cube, cancel)?;
        check_cancelled(cancel)?;
        cube.apply_crop(&fit, remove_bad)?;
        Ok(Some(fit))
    }
}
