//! Core data types shared by the pool, cubes and croppers

use crate::error::{CubeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of an extension, named after its FITS `BITPIX` code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        self.bitpix().unsigned_abs() as usize / 8
    }

    /// FITS `BITPIX`: bits per element, negative for floating point
    pub fn bitpix(&self) -> i32 {
        match self {
            DataType::U8 => 8,
            DataType::I16 => 16,
            DataType::I32 => 32,
            DataType::I64 => 64,
            DataType::F32 => -32,
            DataType::F64 => -64,
        }
    }

    pub fn from_bitpix(bitpix: i32) -> Option<Self> {
        match bitpix {
            8 => Some(DataType::U8),
            16 => Some(DataType::I16),
            32 => Some(DataType::I32),
            64 => Some(DataType::I64),
            -32 => Some(DataType::F32),
            -64 => Some(DataType::F64),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BITPIX={}", self.bitpix())
    }
}

/// Retention mode of a file handle pool entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PoolMode {
    /// Eviction candidate
    #[default]
    Volatile,
    /// Only evicted once no volatile entry remains
    Persistent,
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolMode::Volatile => write!(f, "volatile"),
            PoolMode::Persistent => write!(f, "persistent"),
        }
    }
}

/// Instrument modality of an observation file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modality {
    /// Slit-jaw imager
    Sji,
    /// Spectrograph raster
    Raster,
}

/// Pointing strategy of an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservationMode {
    SitAndStare,
    NStepRaster,
}

impl ObservationMode {
    /// Derive the mode from an observation description
    pub fn from_description(desc: &str) -> Self {
        if desc.contains("sit-and-stare") {
            ObservationMode::SitAndStare
        } else {
            ObservationMode::NStepRaster
        }
    }
}

impl fmt::Display for ObservationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationMode::SitAndStare => write!(f, "sit-and-stare"),
            ObservationMode::NStepRaster => write!(f, "n-step raster"),
        }
    }
}

/// Crop rectangle in pixel coordinates, `[min, max)` on both axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub xmin: usize,
    pub xmax: usize,
    pub ymin: usize,
    pub ymax: usize,
}

impl Bounds {
    pub fn new(xmin: usize, xmax: usize, ymin: usize, ymax: usize) -> Self {
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    /// Full-frame bounds for an image of `(height, width)`
    pub fn full(height: usize, width: usize) -> Self {
        Self::new(0, width, 0, height)
    }

    pub fn width(&self) -> usize {
        self.xmax.saturating_sub(self.xmin)
    }

    pub fn height(&self) -> usize {
        self.ymax.saturating_sub(self.ymin)
    }

    /// Check `0 <= min < max <= extent` on both axes
    pub fn validate(&self, height: usize, width: usize) -> Result<()> {
        if self.xmin >= self.xmax || self.xmax > width {
            return Err(CubeError::InvalidBounds(format!(
                "x range [{}, {}) does not fit width {}",
                self.xmin, self.xmax, width
            )));
        }
        if self.ymin >= self.ymax || self.ymax > height {
            return Err(CubeError::InvalidBounds(format!(
                "y range [{}, {}) does not fit height {}",
                self.ymin, self.ymax, height
            )));
        }
        Ok(())
    }

    /// True if `other` lies completely inside `self`
    pub fn contains(&self, other: &Bounds) -> bool {
        self.xmin <= other.xmin
            && self.xmax >= other.xmax
            && self.ymin <= other.ymin
            && self.ymax >= other.ymax
    }

    pub fn as_array(&self) -> [usize; 4] {
        [self.xmin, self.xmax, self.ymin, self.ymax]
    }
}

impl From<[usize; 4]> for Bounds {
    fn from(b: [usize; 4]) -> Self {
        Self::new(b[0], b[1], b[2], b[3])
    }
}

/// One row of the step index table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepIndexEntry {
    /// Index into the ordered member files of a cube
    pub file_id: usize,
    /// Offset of the image inside that file's stack
    pub local_step: usize,
    /// Raster position this step was taken at
    pub raster_pos: usize,
}

impl StepIndexEntry {
    pub fn new(file_id: usize, local_step: usize, raster_pos: usize) -> Self {
        Self {
            file_id,
            local_step,
            raster_pos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_bitpix() {
        assert_eq!(DataType::U8.size_in_bytes(), 1);
        assert_eq!(DataType::I16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F64.size_in_bytes(), 8);
        assert_eq!(DataType::from_bitpix(-32), Some(DataType::F32));
        assert_eq!(DataType::from_bitpix(12), None);
        assert_eq!(DataType::I16.to_string(), "BITPIX=16");
    }

    #[test]
    fn test_bounds_validation() {
        let b = Bounds::new(2, 10, 1, 5);
        assert!(b.validate(5, 10).is_ok());
        assert_eq!(b.width(), 8);
        assert_eq!(b.height(), 4);

        assert!(Bounds::new(3, 3, 0, 4).validate(5, 10).is_err());
        assert!(Bounds::new(0, 11, 0, 4).validate(5, 10).is_err());
        assert!(Bounds::new(0, 10, 0, 6).validate(5, 10).is_err());
    }

    #[test]
    fn test_bounds_contains() {
        let outer = Bounds::new(0, 10, 0, 10);
        assert!(outer.contains(&Bounds::new(2, 8, 1, 9)));
        assert!(!Bounds::new(2, 8, 1, 9).contains(&outer));
    }

    #[test]
    fn test_observation_mode() {
        assert_eq!(
            ObservationMode::from_description("Medium sit-and-stare 0.3x60 1s"),
            ObservationMode::SitAndStare
        );
        assert_eq!(
            ObservationMode::from_description("Large dense 96-step raster"),
            ObservationMode::NStepRaster
        );
    }
}
