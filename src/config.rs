//! Runtime configuration for the file pool, cubes and croppers

use crate::compression::CompressionMethod;
use crate::error::{CubeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default cap on simultaneously open files
pub const DEFAULT_MAX_OPEN_FILES: usize = 256;

/// Pixel value that marks missing data
pub const DEFAULT_SENTINEL: f32 = -200.0;

/// Reader configuration consumed by the pool and the data cubes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Hard cap on resident handles in the file pool
    pub max_open_files: usize,

    /// Map files into memory instead of reading slices on demand
    pub use_memmap: bool,

    /// 0: batch, 1: interactive, 2: developer, 3: unfiltered
    pub verbosity_level: u8,

    /// Compression applied to persisted step index tables
    pub index_cache_compression: CompressionMethod,

    /// Pixel value that marks missing data, for null filtering and cropping alike
    pub sentinel: f32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            use_memmap: false,
            verbosity_level: 1,
            index_cache_compression: CompressionMethod::Zstd,
            sentinel: DEFAULT_SENTINEL,
        }
    }
}

impl ReaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the open-file cap
    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    /// Enable or disable memory mapping
    pub fn with_memmap(mut self, use_memmap: bool) -> Self {
        self.use_memmap = use_memmap;
        self
    }

    /// Set the diagnostic verbosity
    pub fn with_verbosity(mut self, verbosity_level: u8) -> Self {
        self.verbosity_level = verbosity_level;
        self
    }

    /// Set the index cache compression
    pub fn with_index_cache_compression(mut self, method: CompressionMethod) -> Self {
        self.index_cache_compression = method;
        self
    }

    /// Set the missing-data value
    pub fn with_sentinel(mut self, sentinel: f32) -> Self {
        self.sentinel = sentinel;
        self
    }

    /// Parse a configuration from JSON, missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ReaderConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_open_files == 0 {
            return Err(CubeError::Configuration(
                "max_open_files must be at least 1".to_string(),
            ));
        }
        if self.verbosity_level > 3 {
            return Err(CubeError::Configuration(format!(
                "verbosity_level must be between 0 and 3, got {}",
                self.verbosity_level
            )));
        }
        if !self.sentinel.is_finite() {
            return Err(CubeError::Configuration(format!(
                "sentinel must be finite, got {}",
                self.sentinel
            )));
        }
        Ok(())
    }

    pub fn verbosity(&self) -> Verbosity {
        Verbosity(self.verbosity_level)
    }
}

/// Gate for diagnostic output; never changes behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verbosity(pub u8);

impl Verbosity {
    pub fn interactive(&self) -> bool {
        self.0 >= 1
    }

    pub fn developer(&self) -> bool {
        self.0 >= 2
    }

    pub fn unfiltered(&self) -> bool {
        self.0 >= 3
    }
}

/// Parameters of the cropping pipeline
///
/// The two thresholds are empirical. Results that hinge on their exact
/// values should not be relied upon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    /// Pixel value that marks missing data
    pub sentinel: f32,

    /// Safety margin moved inward from every detected edge
    pub offset: usize,

    /// Run the interior and border coverage checks
    pub check_coverage: bool,

    /// Maximum tolerated fraction of missing pixels
    pub coverage_threshold: f64,

    /// Maximum tolerated deviation from the median bounds, as a fraction of the image extent
    pub outlier_threshold: f64,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL,
            offset: 0,
            check_coverage: true,
            coverage_threshold: 0.05,
            outlier_threshold: 0.02,
        }
    }
}

impl CropConfig {
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_check_coverage(mut self, check_coverage: bool) -> Self {
        self.check_coverage = check_coverage;
        self
    }

    pub fn with_coverage_threshold(mut self, threshold: f64) -> Self {
        self.coverage_threshold = threshold;
        self
    }

    pub fn with_outlier_threshold(mut self, threshold: f64) -> Self {
        self.outlier_threshold = threshold;
        self
    }

    pub fn with_sentinel(mut self, sentinel: f32) -> Self {
        self.sentinel = sentinel;
        self
    }
}
