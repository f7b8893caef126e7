//! Virtual data cube
//!
//! A [`DataCube`] presents the images of one channel, spread over an ordered
//! list of observation files, as a single time-ordered stack. Expensive state
//! (the step index table and the header lists) is materialized on first use.
//! Pixels are read one plane at a time through the shared [`FileHub`].

use crate::config::{CropConfig, ReaderConfig, Verbosity};
use crate::crop::{CroppableCube, CubeCropper, CubeFit, ImageSource};
use crate::error::{CubeError, Result};
use crate::header::{
    detect_modality, parse_date, policy_for, prepare_primary, records_to_headers, to_epoch, Header,
    HeaderPolicy, HeaderValue,
};
use crate::io::{load_checked, CacheKey, FileSystemIndexCache, IndexCache};
use crate::layout::StepIndexTable;
use crate::metadata::{CubeLayout, ObservationInfo};
use crate::pool::FileHub;
use crate::types::{Bounds, Modality, ObservationMode, PoolMode, StepIndexEntry};
use crate::utils::{format_bytes, CancelToken, LazyField};
use log::{debug, info, warn};
use ndarray::{Array2, Array3, Axis};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Pixels at or above this data number are saturated
pub const SATURATION_LEVEL: f32 = 1.6e4;

/// How a cube selects and filters its images
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CubeOptions {
    /// Substring of the wanted `TDESCn` channel description; empty picks the first
    pub channel: String,

    /// Keep images that contain nothing but missing data
    pub keep_null: bool,

    /// Ignore a cached step index table
    pub force_rescan: bool,
}

impl CubeOptions {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    pub fn with_keep_null(mut self, keep_null: bool) -> Self {
        self.keep_null = keep_null;
        self
    }

    pub fn with_force_rescan(mut self, force_rescan: bool) -> Self {
        self.force_rescan = force_rescan;
        self
    }
}

/// Result of a bulk read
#[derive(Debug, Clone, PartialEq)]
pub enum CubeSlice {
    /// A single step
    Image(Array2<f32>),
    /// Several steps along axis 0
    Stack(Array3<f32>),
}

impl CubeSlice {
    pub fn shape(&self) -> &[usize] {
        match self {
            CubeSlice::Image(image) => image.shape(),
            CubeSlice::Stack(stack) => stack.shape(),
        }
    }

    /// Always three-dimensional
    pub fn into_stack(self) -> Array3<f32> {
        match self {
            CubeSlice::Image(image) => image.insert_axis(Axis(0)),
            CubeSlice::Stack(stack) => stack,
        }
    }
}

/// One channel of an observation as a virtual `(step, y, x)` array
pub struct DataCube {
    files: Vec<PathBuf>,
    options: CubeOptions,
    verbosity: Verbosity,
    sentinel: f32,
    hub: Arc<FileHub>,
    cache: Arc<dyn IndexCache>,
    policy: Box<dyn HeaderPolicy>,
    layout: CubeLayout,
    info: ObservationInfo,
    primary_raw: Header,
    line_specific: Option<Header>,
    bounds: Option<Bounds>,
    closed: bool,

    table: LazyField<StepIndexTable>,
    primary: LazyField<Header>,
    time_specific: LazyField<Vec<Header>>,
    combined: LazyField<Vec<Header>>,
    // survives step removal: rows keep their physical coordinates
    records: RwLock<HashMap<usize, Arc<Vec<Header>>>>,
}

impl DataCube {
    /// Open the cube formed by `files`, in order
    ///
    /// Only the first file is read here; everything expensive is deferred.
    pub fn open(
        files: Vec<PathBuf>,
        options: CubeOptions,
        hub: Arc<FileHub>,
        config: &ReaderConfig,
    ) -> Result<Self> {
        config.validate()?;
        let first = files
            .first()
            .cloned()
            .ok_or_else(|| CubeError::EmptyCube("no files given".to_string()))?;

        let (layout, primary_raw, extension_header, modality, first_depth) =
            hub.with_file(&first, PoolMode::Persistent, |file| {
                let primary_raw = file.extension(0)?.header.clone();
                let modality = detect_modality(&primary_raw, file.path())?;
                let layout = CubeLayout::detect(file, &options.channel)?;
                let depth = layout.member_depth(file)?;
                let extension_header = file.extension(layout.selected_ext)?.header.clone();
                Ok((layout, primary_raw, extension_header, modality, depth))
            })?;

        let info = ObservationInfo::from_primary(&primary_raw, &layout, modality, first_depth, &first)?;
        let policy = policy_for(modality);
        let line_specific = policy.line_specific(&primary_raw, &extension_header, layout.channel);

        let verbosity = config.verbosity();
        if verbosity.interactive() {
            info!(
                "opened {:?} cube '{}' ({}) over {} file(s), frame {}x{}",
                modality,
                info.line_info,
                info.obsid,
                files.len(),
                layout.height,
                layout.width
            );
        }

        Ok(Self {
            files,
            options,
            verbosity,
            sentinel: config.sentinel,
            hub,
            cache: Arc::new(FileSystemIndexCache::new(config.index_cache_compression)),
            policy,
            layout,
            info,
            primary_raw,
            line_specific,
            bounds: None,
            closed: false,
            table: LazyField::new(),
            primary: LazyField::new(),
            time_specific: LazyField::new(),
            combined: LazyField::new(),
            records: RwLock::new(HashMap::new()),
        })
    }

    /// Use a different store for step index tables
    pub fn with_index_cache(mut self, cache: Arc<dyn IndexCache>) -> Self {
        self.cache = cache;
        self.table.invalidate();
        self
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn options(&self) -> &CubeOptions {
        &self.options
    }

    pub fn info(&self) -> &ObservationInfo {
        &self.info
    }

    pub fn layout(&self) -> &CubeLayout {
        &self.layout
    }

    pub fn hub(&self) -> &Arc<FileHub> {
        &self.hub
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Pixel value that marks missing data
    pub fn sentinel(&self) -> f32 {
        self.sentinel
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_cropped(&self) -> bool {
        self.bounds.is_some()
    }

    /// Current crop rectangle, if any
    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    fn frame(&self) -> Bounds {
        self.bounds
            .unwrap_or_else(|| Bounds::full(self.layout.height, self.layout.width))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(CubeError::Closed)
        } else {
            Ok(())
        }
    }

    // the first file carries the structural metadata and stays resident
    fn mode_for(&self, file_id: usize) -> PoolMode {
        if file_id == 0 {
            PoolMode::Persistent
        } else {
            PoolMode::Volatile
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        let directory = self
            .files
            .first()
            .and_then(|p| p.parent())
            .unwrap_or_else(|| Path::new("."));
        let channel = if self.info.line_info.is_empty() {
            format!("channel{}", self.layout.channel)
        } else {
            self.info.line_info.clone()
        };
        CacheKey::new(directory, channel, self.options.keep_null)
            .with_members(&self.files)
            .with_sentinel(self.sentinel)
    }

    /// The step index table, building it on first use
    pub fn step_index(&self) -> Result<Arc<StepIndexTable>> {
        self.table.get_or_try_init(|| self.build_step_index())
    }

    fn build_step_index(&self) -> Result<StepIndexTable> {
        self.ensure_open()?;
        let key = self.cache_key();

        let cached = if self.options.force_rescan {
            None
        } else {
            load_checked(self.cache.as_ref(), &key, self.files.len())
        };
        let table = match cached {
            Some(table) => {
                if self.verbosity.developer() {
                    debug!("step index for '{}' loaded from cache", key.channel);
                }
                table
            }
            None => {
                let (table, skipped) = if self.options.keep_null {
                    let depths = self.member_depths()?;
                    let skipped = depths.iter().filter(|d| d.is_none()).count();
                    let counts: Vec<usize> = depths.into_iter().map(|d| d.unwrap_or(0)).collect();
                    (
                        StepIndexTable::from_step_counts(&counts, self.info.n_raster_positions),
                        skipped,
                    )
                } else {
                    self.scan_valid_steps()?
                };
                // a skipped member may only have failed transiently
                if skipped > 0 {
                    warn!(
                        "not caching the step index for '{}': {} file(s) were skipped",
                        key.channel, skipped
                    );
                } else if let Err(e) = self.cache.store(&key, &table) {
                    warn!("could not store step index {}: {}", key.file_name(), e);
                }
                table
            }
        };

        if table.is_empty() {
            return Err(CubeError::EmptyCube(format!(
                "'{}' contains no valid images",
                self.info.line_info
            )));
        }
        Ok(table)
    }

    /// Run `f` on member `file_id`, skipping corrupt members after the first
    fn for_member<T>(
        &self,
        file_id: usize,
        f: impl Fn(&dyn crate::container::ImageFile) -> Result<T>,
    ) -> Result<Option<T>> {
        match self.hub.with_file(&self.files[file_id], self.mode_for(file_id), f) {
            Ok(value) => Ok(Some(value)),
            Err(e) if file_id == 0 || e.is_too_many_open_files() => Err(e),
            Err(e) => {
                warn!("skipping file {}: {}", self.files[file_id].display(), e);
                Ok(None)
            }
        }
    }

    /// Stack depth per member, `None` for skipped members
    fn member_depths(&self) -> Result<Vec<Option<usize>>> {
        (0..self.files.len())
            .map(|file_id| self.for_member(file_id, |file| self.layout.member_depth(file)))
            .collect()
    }

    /// Read every frame and keep those with at least one valid pixel
    ///
    /// Also returns the number of skipped members.
    fn scan_valid_steps(&self) -> Result<(StepIndexTable, usize)> {
        let (height, width) = (self.layout.height, self.layout.width);
        let positions = self.info.n_raster_positions.max(1);
        let mut table = StepIndexTable::new();
        let (mut scanned, mut skipped) = (0, 0);

        for file_id in 0..self.files.len() {
            let valid = self.for_member(file_id, |file| {
                let depth = self.layout.member_depth(file)?;
                let mut valid = Vec::with_capacity(depth);
                for local in 0..depth {
                    let plane = file.read_plane(self.layout.selected_ext, local, 0..height, 0..width)?;
                    if plane.iter().any(|&v| v > self.sentinel) {
                        valid.push(local);
                    }
                }
                Ok((depth, valid))
            })?;
            match valid {
                Some((depth, valid)) => {
                    scanned += depth;
                    for local in valid {
                        table.push(StepIndexEntry::new(file_id, local, local % positions));
                    }
                }
                None => skipped += 1,
            }
        }

        if self.verbosity.developer() {
            debug!(
                "scanned {} frames ({}), {} valid",
                scanned,
                format_bytes(scanned * height * width * std::mem::size_of::<f32>()),
                table.len()
            );
        }
        Ok((table, skipped))
    }

    pub fn n_steps(&self) -> Result<usize> {
        Ok(self.step_index()?.len())
    }

    /// `(n_steps, height, width)`, with height and width after cropping
    pub fn shape(&self) -> Result<(usize, usize, usize)> {
        let frame = self.frame();
        Ok((self.n_steps()?, frame.height(), frame.width()))
    }

    /// Number of steps taken at `raster_pos`
    pub fn get_raster_pos_steps(&self, raster_pos: usize) -> Result<usize> {
        self.check_raster_pos(raster_pos)?;
        Ok(self.step_index()?.steps_at_raster_pos(raster_pos).len())
    }

    fn check_raster_pos(&self, raster_pos: usize) -> Result<()> {
        if raster_pos >= self.info.n_raster_positions {
            return Err(CubeError::OutOfRange(format!(
                "raster position {} outside 0..{}",
                raster_pos, self.info.n_raster_positions
            )));
        }
        Ok(())
    }

    fn read_entry(&self, entry: &StepIndexEntry) -> Result<Array2<f32>> {
        self.ensure_open()?;
        let frame = self.frame();
        self.hub
            .with_file(&self.files[entry.file_id], self.mode_for(entry.file_id), |file| {
                file.read_plane(
                    self.layout.selected_ext,
                    entry.local_step,
                    frame.ymin..frame.ymax,
                    frame.xmin..frame.xmax,
                )
            })
    }

    /// Read one image, reading only that plane from disk
    ///
    /// With `raster_pos`, `step` counts only the images taken at that
    /// position. With `divide_by_exptime`, positive pixels are divided by the
    /// step's exposure time; missing-data pixels keep their value.
    pub fn get_image_step(
        &self,
        step: usize,
        raster_pos: Option<usize>,
        divide_by_exptime: bool,
    ) -> Result<Array2<f32>> {
        let table = self.step_index()?;
        let (logical, entry) = match raster_pos {
            None => (step, table.get(step)?),
            Some(pos) => {
                self.check_raster_pos(pos)?;
                table.get_at_raster_pos(step, pos)?
            }
        };
        let mut image = self.read_entry(&entry)?;

        if divide_by_exptime {
            match self.header(logical)?.get("EXPTIME").and_then(HeaderValue::as_f64) {
                Some(exptime) if exptime > 0.0 => {
                    let exptime = exptime as f32;
                    image.mapv_inplace(|v| if v > 0.0 { v / exptime } else { v });
                }
                _ => warn!("no exposure time for step {}, image left in data numbers", logical),
            }
        }
        Ok(image)
    }

    /// Number of saturated pixels of a step
    pub fn get_nsatpix(&self, step: usize) -> Result<usize> {
        Ok(self
            .get_image_step(step, None, false)?
            .iter()
            .filter(|&&v| v >= SATURATION_LEVEL)
            .count())
    }

    /// Bulk read of `steps`, with `rows` and `cols` relative to the crop rectangle
    ///
    /// Reads are grouped per file and stacked in logical order. A single
    /// step comes back as [`CubeSlice::Image`].
    pub fn slice(
        &self,
        steps: Range<usize>,
        rows: Range<usize>,
        cols: Range<usize>,
    ) -> Result<CubeSlice> {
        self.ensure_open()?;
        let frame = self.frame();
        if steps.is_empty()
            || rows.start > rows.end
            || rows.end > frame.height()
            || cols.start > cols.end
            || cols.end > frame.width()
        {
            return Err(CubeError::OutOfRange(format!(
                "slice [{:?}, {:?}, {:?}] of a cube with frame {}x{}",
                steps,
                rows,
                cols,
                frame.height(),
                frame.width()
            )));
        }
        let abs_rows = frame.ymin + rows.start..frame.ymin + rows.end;
        let abs_cols = frame.xmin + cols.start..frame.xmin + cols.end;

        let table = self.step_index()?;
        let mut planes = Vec::with_capacity(steps.len());
        for run in table.group_by_file(steps)? {
            let mut read = self
                .hub
                .with_file(&self.files[run.file_id], self.mode_for(run.file_id), |file| {
                    run.steps
                        .clone()
                        .map(|s| {
                            file.read_plane(
                                self.layout.selected_ext,
                                table.rows()[s].local_step,
                                abs_rows.clone(),
                                abs_cols.clone(),
                            )
                        })
                        .collect::<Result<Vec<_>>>()
                })?;
            planes.append(&mut read);
        }

        if planes.len() == 1 {
            if let Some(image) = planes.pop() {
                return Ok(CubeSlice::Image(image));
            }
        }
        let views: Vec<_> = planes.iter().map(|p| p.view()).collect();
        let stack = ndarray::stack(Axis(0), &views)
            .map_err(|e| CubeError::InvalidBounds(e.to_string()))?;
        Ok(CubeSlice::Stack(stack))
    }

    fn file_records(&self, file_id: usize) -> Result<Arc<Vec<Header>>> {
        if let Some(records) = self.records.read().get(&file_id) {
            return Ok(Arc::clone(records));
        }
        self.ensure_open()?;
        let ext = self.layout.metadata_ext;
        let mut headers = self
            .hub
            .with_file(&self.files[file_id], self.mode_for(file_id), |file| {
                let data = file.read_table(ext)?;
                records_to_headers(&file.extension(ext)?.header, &data, &self.info.start, file.path())
            })?;
        for header in &mut headers {
            self.policy.fix_time_specific(header);
        }
        let headers = Arc::new(headers);
        self.records.write().insert(file_id, Arc::clone(&headers));
        Ok(headers)
    }

    fn record_for(&self, entry: &StepIndexEntry) -> Result<Header> {
        self.file_records(entry.file_id)?
            .get(entry.local_step)
            .cloned()
            .ok_or_else(|| {
                CubeError::corrupt(
                    &self.files[entry.file_id],
                    format!("no record for image {}", entry.local_step),
                )
            })
    }

    /// Normalized primary header of the first file
    pub fn primary_headers(&self) -> Result<Arc<Header>> {
        self.primary
            .get_or_try_init(|| prepare_primary(&self.primary_raw, &self.files[0]))
    }

    /// Extension header of the selected channel, for modalities that have one
    pub fn line_specific_headers(&self) -> Option<&Header> {
        self.line_specific.as_ref()
    }

    /// Time-specific header of a single step; loads only the owning file's records
    pub fn time_specific_header(&self, step: usize) -> Result<Header> {
        let entry = self.step_index()?.get(step)?;
        self.record_for(&entry)
    }

    pub fn time_specific_headers(&self) -> Result<Arc<Vec<Header>>> {
        self.time_specific.get_or_try_init(|| {
            self.step_index()?
                .rows()
                .iter()
                .map(|entry| self.record_for(entry))
                .collect()
        })
    }

    /// Combined header of a single step
    pub fn header(&self, step: usize) -> Result<Header> {
        let time_specific = self.time_specific_header(step)?;
        Ok(self.policy.combine(
            &*self.primary_headers()?,
            self.line_specific.as_ref(),
            &time_specific,
            self.layout.channel,
        ))
    }

    /// Combined primary, line-specific and time-specific headers, one per step
    pub fn headers(&self) -> Result<Arc<Vec<Header>>> {
        self.combined.get_or_try_init(|| {
            let primary = self.primary_headers()?;
            Ok(self
                .time_specific_headers()?
                .iter()
                .map(|t| {
                    self.policy
                        .combine(&primary, self.line_specific.as_ref(), t, self.layout.channel)
                })
                .collect())
        })
    }

    /// Seconds since the Unix epoch of every step
    pub fn get_timestamps(&self) -> Result<Vec<f64>> {
        self.time_specific_headers()?
            .iter()
            .map(|header| {
                let date = header
                    .get("DATE_OBS")
                    .and_then(HeaderValue::as_str)
                    .ok_or_else(|| CubeError::corrupt(&self.files[0], "record without DATE_OBS"))?;
                Ok(to_epoch(&parse_date(date)?))
            })
            .collect()
    }

    fn replace_table(&mut self, table: StepIndexTable) {
        self.table.set(table);
        self.time_specific.invalidate();
        self.combined.invalidate();
    }

    /// Delete logical steps
    ///
    /// Survivors keep their file and local index. Fails without changes if
    /// an index is out of range or no step would be left.
    pub fn remove_steps(&mut self, steps: &[usize]) -> Result<()> {
        let mut table = (*self.step_index()?).clone();
        table.remove_rows(steps)?;
        if table.is_empty() {
            return Err(CubeError::EmptyCube(format!(
                "removing {} step(s) would leave no images",
                steps.len()
            )));
        }
        self.replace_table(table);
        Ok(())
    }

    /// Like [`remove_steps`](Self::remove_steps) but may empty the cube
    pub(crate) fn remove_steps_allow_empty(&mut self, steps: &[usize]) -> Result<()> {
        let mut table = (*self.step_index()?).clone();
        table.remove_rows(steps)?;
        self.replace_table(table);
        Ok(())
    }

    /// Restrict every read to `bounds`, given in full-frame pixels
    pub fn set_bounds(&mut self, bounds: Bounds) -> Result<()> {
        self.ensure_open()?;
        bounds.validate(self.layout.height, self.layout.width)?;
        self.bounds = Some(bounds);
        Ok(())
    }

    pub fn reset_bounds(&mut self) {
        self.bounds = None;
    }

    /// Crop with the default cropper; `Ok(None)` if already cropped
    pub fn crop(&mut self, remove_bad: bool, check_coverage: bool) -> Result<Option<CubeFit>> {
        let cropper = CubeCropper::new(
            CropConfig::default()
                .with_sentinel(self.sentinel)
                .with_check_coverage(check_coverage),
        );
        self.crop_with(&cropper, remove_bad, None)
    }

    /// Crop with `cropper`; a failed or cancelled crop leaves the cube as it was
    pub fn crop_with(
        &mut self,
        cropper: &CubeCropper,
        remove_bad: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<CubeFit>> {
        self.ensure_open()?;
        cropper.check_sentinel(self.sentinel)?;
        cropper.fit_transform(self, remove_bad, cancel)
    }

    /// Release every member file; later reads fail with [`CubeError::Closed`]
    pub fn close(&mut self) {
        for path in &self.files {
            self.hub.close(path);
        }
        self.closed = true;
    }

    /// Undo [`close`](Self::close), checking that the first file still has the same layout
    pub fn reopen(&mut self) -> Result<()> {
        if !self.closed {
            info!("data cube is already open, doing nothing");
            return Ok(());
        }
        let layout = self.hub.with_file(&self.files[0], PoolMode::Persistent, |file| {
            CubeLayout::detect(file, &self.options.channel)
        })?;
        if layout != self.layout {
            return Err(CubeError::corrupt(&self.files[0], "layout changed since the cube was opened"));
        }
        self.closed = false;
        Ok(())
    }
}

impl ImageSource for DataCube {
    fn n_steps(&self) -> Result<usize> {
        DataCube::n_steps(self)
    }

    fn read_image(&self, step: usize) -> Result<Array2<f32>> {
        self.get_image_step(step, None, false)
    }

    fn modality(&self) -> Modality {
        self.info.modality
    }

    fn observation_mode(&self) -> ObservationMode {
        self.info.mode
    }
}

impl CroppableCube for DataCube {
    fn is_cropped(&self) -> bool {
        DataCube::is_cropped(self)
    }

    fn apply_crop(&mut self, fit: &CubeFit, remove_bad: bool) -> Result<()> {
        fit.bounds.validate(self.layout.height, self.layout.width)?;
        let removed = if remove_bad { fit.removed_steps() } else { Vec::new() };
        if removed.len() >= self.n_steps()? {
            return Err(CubeError::EmptyCube(
                "cropping would remove every image".to_string(),
            ));
        }
        if !removed.is_empty() {
            self.remove_steps(&removed)?;
        }
        self.bounds = Some(fit.bounds);
        if self.verbosity.interactive() {
            info!(
                "cropped '{}' to {:?}, removed {} step(s)",
                self.info.line_info,
                fit.bounds.as_array(),
                removed.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use crate::container::ContainerWriter;
    use crate::io::MemoryIndexCache;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2, Array3};
    use tempfile::TempDir;

    const NULL: f32 = -200.0;

    fn sji_primary() -> Header {
        let mut h = Header::new();
        h.insert("INSTRUME".into(), "SJI".into());
        h.insert("OBSID".into(), HeaderValue::Int(3620258102));
        h.insert("OBS_DESC".into(), "Medium sit-and-stare 0.3x60 1s".into());
        h.insert("STARTOBS".into(), "2014-03-29T14:09:38.830".into());
        h.insert("ENDOBS".into(), "2014-03-29T17:54:10.000".into());
        h.insert("TDESC1".into(), "SJI_1400".into());
        h.insert("SAA".into(), " 0".into());
        h
    }

    /// Slit-jaw file whose frame `i` is filled with `values[i]`
    fn write_sji(dir: &Path, name: &str, values: &[f32]) -> PathBuf {
        let stack = Array3::from_shape_fn((values.len(), 6, 8), |(s, y, x)| {
            if values[s] == NULL {
                NULL
            } else {
                values[s] + (y * 8 + x) as f32
            }
        });
        let mut records = Header::new();
        records.insert("TIME".into(), HeaderValue::Int(0));
        records.insert("EXPTIMES".into(), HeaderValue::Int(1));
        let table = Array2::from_shape_fn((values.len(), 2), |(s, c)| {
            if c == 0 {
                s as f64 * 10.0
            } else {
                2.0
            }
        });

        let mut writer = ContainerWriter::new(sji_primary());
        writer.add_image_stack(Header::new(), &stack);
        writer
            .add_table(records, &table, CompressionMethod::Zstd)
            .unwrap();
        let path = dir.join(name);
        writer.write(&path).unwrap();
        path
    }

    fn open(files: Vec<PathBuf>, options: CubeOptions) -> DataCube {
        let config = ReaderConfig::default();
        let hub = Arc::new(FileHub::new(&config));
        DataCube::open(files, options, hub, &config)
            .unwrap()
            .with_index_cache(Arc::new(MemoryIndexCache::new()))
    }

    #[test]
    fn test_null_frames_are_dropped() {
        let dir = TempDir::new().unwrap();
        let file = write_sji(dir.path(), "a.irc", &[100.0, NULL, 300.0]);
        let cube = open(vec![file.clone()], CubeOptions::default());
        assert_eq!(cube.n_steps().unwrap(), 2);
        let locals: Vec<_> = cube
            .step_index()
            .unwrap()
            .rows()
            .iter()
            .map(|r| r.local_step)
            .collect();
        assert_eq!(locals, vec![0, 2]);
        assert_eq!(cube.shape().unwrap(), (2, 6, 8));

        let kept = open(vec![file], CubeOptions::default().with_keep_null(true));
        assert_eq!(kept.n_steps().unwrap(), 3);
    }

    #[test]
    fn test_get_image_step() {
        let dir = TempDir::new().unwrap();
        let cube = open(
            vec![write_sji(dir.path(), "a.irc", &[100.0, NULL, 300.0])],
            CubeOptions::default(),
        );
        let image = cube.get_image_step(1, None, false).unwrap();
        assert_eq!(image.dim(), (6, 8));
        assert_eq!(image[[0, 0]], 300.0);

        let scaled = cube.get_image_step(1, None, true).unwrap();
        assert_relative_eq!(scaled[[0, 1]], 150.5);

        assert!(cube.get_image_step(2, None, false).unwrap_err().is_range_error());
        assert!(cube.get_image_step(0, Some(1), false).unwrap_err().is_range_error());
        assert_eq!(cube.get_raster_pos_steps(0).unwrap(), 2);
    }

    #[test]
    fn test_headers_follow_removals() {
        let dir = TempDir::new().unwrap();
        let mut cube = open(
            vec![write_sji(dir.path(), "a.irc", &[1.0, 2.0, 3.0])],
            CubeOptions::default(),
        );
        assert_eq!(cube.headers().unwrap().len(), 3);
        assert_eq!(cube.header(0).unwrap()["EXPTIME"].as_f64(), Some(2.0));
        assert_eq!(
            cube.primary_headers().unwrap()["SAA"],
            HeaderValue::Text("0".into())
        );

        cube.remove_steps(&[0]).unwrap();
        let headers = cube.time_specific_headers().unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0]["TIME"].as_f64(), Some(10.0));
        assert_eq!(
            headers[0]["DATE_OBS"],
            HeaderValue::Text("2014-03-29T14:09:48.830".into())
        );

        let stamps = cube.get_timestamps().unwrap();
        assert_relative_eq!(stamps[1] - stamps[0], 10.0, epsilon = 1e-3);

        assert!(matches!(
            cube.remove_steps(&[0, 1]),
            Err(CubeError::EmptyCube(_))
        ));
        assert_eq!(cube.n_steps().unwrap(), 2);
    }

    #[test]
    fn test_bounds_and_slices() {
        let dir = TempDir::new().unwrap();
        let mut cube = open(
            vec![
                write_sji(dir.path(), "a.irc", &[0.0, 1000.0]),
                write_sji(dir.path(), "b.irc", &[2000.0]),
            ],
            CubeOptions::default(),
        );
        assert!(cube.set_bounds(Bounds::new(2, 9, 0, 6)).is_err());
        cube.set_bounds(Bounds::new(2, 6, 1, 4)).unwrap();
        assert_eq!(cube.shape().unwrap(), (3, 3, 4));

        let image = cube.get_image_step(0, None, false).unwrap();
        assert_eq!(image[[0, 0]], 10.0);

        match cube.slice(1..3, 0..2, 0..1).unwrap() {
            CubeSlice::Stack(stack) => {
                assert_eq!(stack.shape(), &[2, 2, 1]);
                assert_eq!(stack[[0, 0, 0]], 1010.0);
                assert_eq!(stack[[1, 1, 0]], 2018.0);
            }
            other => panic!("expected a stack, got {:?}", other),
        }
        assert_eq!(
            cube.slice(2..3, 0..1, 0..2).unwrap(),
            CubeSlice::Image(array![[2010.0, 2011.0]])
        );
        assert!(cube.slice(0..1, 0..4, 0..1).is_err());

        cube.reset_bounds();
        assert_eq!(cube.shape().unwrap(), (3, 6, 8));
    }

    #[test]
    fn test_nsatpix() {
        let dir = TempDir::new().unwrap();
        let cube = open(
            vec![write_sji(dir.path(), "a.irc", &[15_980.0])],
            CubeOptions::default(),
        );
        // 15980 + y * 8 + x reaches 16000 from pixel index 20 onwards
        assert_eq!(cube.get_nsatpix(0).unwrap(), 48 - 20);
    }

    #[test]
    fn test_close_and_reopen() {
        let dir = TempDir::new().unwrap();
        let mut cube = open(
            vec![write_sji(dir.path(), "a.irc", &[1.0])],
            CubeOptions::default(),
        );
        cube.close();
        assert!(cube.is_closed());
        assert!(matches!(
            cube.get_image_step(0, None, false),
            Err(CubeError::Closed)
        ));
        cube.reopen().unwrap();
        assert!(cube.get_image_step(0, None, false).is_ok());
    }

    #[test]
    fn test_unsupported_instrument() {
        let dir = TempDir::new().unwrap();
        let mut primary = sji_primary();
        primary.insert("INSTRUME".into(), "AIA".into());
        let mut writer = ContainerWriter::new(primary);
        writer.add_image_stack(Header::new(), &Array3::zeros((1, 2, 2)));
        let path = dir.path().join("aia.irc");
        writer.write(&path).unwrap();

        let config = ReaderConfig::default();
        let hub = Arc::new(FileHub::new(&config));
        assert!(matches!(
            DataCube::open(vec![path], CubeOptions::default(), hub, &config),
            Err(CubeError::UnsupportedFile(_))
        ));
    }
}
