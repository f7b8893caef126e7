//! Structural and static metadata of an observation

use crate::container::ImageFile;
use crate::error::{CubeError, Result};
use crate::header::{describe_line, find_channel, parse_date, Header, HeaderValue, STRUCTURAL_KEYS};
use crate::types::{Modality, ObservationMode};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Where the image stacks and per-step records live inside a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeLayout {
    /// First extension holding a three-dimensional image stack
    pub first_data_ext: usize,

    /// Last extension holding a three-dimensional image stack
    pub last_data_ext: usize,

    /// Extension of the selected channel
    pub selected_ext: usize,

    /// Per-step record table
    pub metadata_ext: usize,

    /// One-based channel number as used by `TDESCn`
    pub channel: usize,

    /// Image height of the selected channel
    pub height: usize,

    /// Image width of the selected channel
    pub width: usize,
}

impl CubeLayout {
    /// Detect the layout of `file` and resolve the channel `selector`
    ///
    /// Image stacks are the three-dimensional extensions; the record table
    /// is the first two-dimensional extension after the last stack.
    pub fn detect(file: &dyn ImageFile, selector: &str) -> Result<Self> {
        let path = file.path();
        let mut stacks = Vec::new();
        for i in 0..file.n_extensions() {
            if file.extension(i)?.ndim() == 3 {
                stacks.push(i);
            }
        }
        let (first_data_ext, last_data_ext) = match (stacks.first(), stacks.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return Err(CubeError::corrupt(path, "no image stacks found")),
        };

        let metadata_ext = (last_data_ext + 1..file.n_extensions())
            .find(|&i| file.extension(i).is_ok_and(|ext| ext.ndim() == 2))
            .ok_or_else(|| CubeError::corrupt(path, "no per-step record table found"))?;

        let position = find_channel(&file.extension(0)?.header, selector)?;
        let selected_ext = first_data_ext + position;
        if selected_ext > last_data_ext {
            return Err(CubeError::InvalidChannel(format!(
                "channel {} has no image stack in {}",
                position + 1,
                path.display()
            )));
        }
        let stack = file.extension(selected_ext)?;
        if stack.ndim() != 3 {
            return Err(CubeError::corrupt(
                path,
                format!("extension {} is not a three-dimensional image stack", selected_ext),
            ));
        }

        let records = file.extension(metadata_ext)?;
        let declared = records
            .header
            .keys()
            .filter(|key| !STRUCTURAL_KEYS.contains(&key.as_str()))
            .count();
        if records.shape[1] != declared {
            return Err(CubeError::corrupt(
                path,
                format!(
                    "record table has {} columns but {} header keys",
                    records.shape[1], declared
                ),
            ));
        }

        Ok(Self {
            first_data_ext,
            last_data_ext,
            selected_ext,
            metadata_ext,
            channel: position + 1,
            height: stack.shape[1],
            width: stack.shape[2],
        })
    }

    /// Number of images `file` contributes, checked against this layout
    pub fn member_depth(&self, file: &dyn ImageFile) -> Result<usize> {
        let path = file.path();
        let stack = file.extension(self.selected_ext).map_err(|_| {
            CubeError::corrupt(path, format!("missing extension {}", self.selected_ext))
        })?;
        if stack.ndim() != 3 || stack.shape[1] != self.height || stack.shape[2] != self.width {
            return Err(CubeError::corrupt(
                path,
                format!(
                    "stack shape {:?} does not match {}x{}",
                    stack.shape, self.height, self.width
                ),
            ));
        }
        let records = file.extension(self.metadata_ext).map_err(|_| {
            CubeError::corrupt(path, format!("missing extension {}", self.metadata_ext))
        })?;
        if records.ndim() != 2 || records.shape[0] < stack.shape[0] {
            return Err(CubeError::corrupt(
                path,
                format!(
                    "record table {:?} does not cover {} images",
                    records.shape, stack.shape[0]
                ),
            ));
        }
        Ok(stack.shape[0])
    }
}

/// Cheap scalar facts about an observation, read once at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationInfo {
    pub obsid: String,
    pub description: String,
    pub mode: ObservationMode,
    pub modality: Modality,
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
    /// Channel description with slit-jaw names expanded
    pub line_info: String,
    /// Size of the cyclic set of pointing positions
    pub n_raster_positions: usize,
}

impl ObservationInfo {
    pub fn from_primary(
        primary: &Header,
        layout: &CubeLayout,
        modality: Modality,
        first_depth: usize,
        path: &std::path::Path,
    ) -> Result<Self> {
        let text = |key: &str| primary.get(key).map(HeaderValue::to_string).unwrap_or_default();

        let start = primary
            .get("STARTOBS")
            .and_then(HeaderValue::as_str)
            .ok_or_else(|| CubeError::corrupt(path, "no STARTOBS in primary header"))
            .and_then(|s| parse_date(s).map_err(|e| CubeError::corrupt(path, e.to_string())))?;
        let end = primary
            .get("ENDOBS")
            .and_then(HeaderValue::as_str)
            .and_then(|s| parse_date(s).ok());

        let description = text("OBS_DESC");
        let n_raster_positions = match primary.get("RASNRPT").and_then(HeaderValue::as_i64) {
            Some(n) if n > 0 => n as usize,
            _ => match modality {
                Modality::Raster => first_depth.max(1),
                Modality::Sji => 1,
            },
        };

        Ok(Self {
            obsid: text("OBSID"),
            mode: ObservationMode::from_description(&description),
            description,
            modality,
            start,
            end,
            line_info: describe_line(&text(&format!("TDESC{}", layout.channel))),
            n_raster_positions,
        })
    }

    pub fn is_sit_and_stare(&self) -> bool {
        self.mode == ObservationMode::SitAndStare
    }
}
