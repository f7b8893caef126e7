//! Several data cubes of one channel read as a single cube
//!
//! Member cubes keep their own step index tables. The combined cube adds a
//! second-level lookup from combined step to `(member, local step)`, built
//! lazily and rebuilt after every structural change. Mutations are checked
//! against every member before any member is touched.

use crate::config::{CropConfig, Verbosity};
use crate::crop::{CroppableCube, CubeCropper, CubeFit, ImageSource};
use crate::cube::{CubeSlice, DataCube};
use crate::error::{CubeError, Result};
use crate::header::Header;
use crate::types::{Bounds, Modality, ObservationMode};
use crate::utils::{CancelToken, LazyField};
use log::{info, warn};
use ndarray::{Array2, Axis};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

/// World-coordinate keys that only make sense for a single member
const MEMBER_SPECIFIC_KEYS: [&str; 10] = [
    "CRVAL2", "CRVAL3", "PC1_1", "PC1_2", "PC2_1", "PC2_2", "PC2_3", "PC3_1", "PC3_2", "PC3_3",
];

/// End-to-end concatenation of data cubes sharing a channel
pub struct CombinedCube {
    members: Vec<DataCube>,
    verbosity: Verbosity,
    line_specific: Option<Header>,
    lookup: LazyField<Vec<(usize, usize)>>,
    time_specific: LazyField<Vec<Header>>,
    combined: LazyField<Vec<Header>>,
}

impl CombinedCube {
    /// Combine `members` in order
    ///
    /// Members must share modality, channel, frame size and missing-data value.
    pub fn new(members: Vec<DataCube>) -> Result<Self> {
        let first = members
            .first()
            .ok_or_else(|| CubeError::EmptyCube("no member cubes given".to_string()))?;
        let (layout, info) = (first.layout(), first.info());
        for (m, cube) in members.iter().enumerate().skip(1) {
            if cube.info().modality != info.modality
                || cube.info().line_info != info.line_info
                || cube.layout().height != layout.height
                || cube.layout().width != layout.width
            {
                return Err(CubeError::Configuration(format!(
                    "member {} ('{}', {}x{}) does not match '{}' ({}x{})",
                    m,
                    cube.info().line_info,
                    cube.layout().height,
                    cube.layout().width,
                    info.line_info,
                    layout.height,
                    layout.width
                )));
            }
            if cube.sentinel() != first.sentinel() {
                return Err(CubeError::Configuration(format!(
                    "member {} treats {} as missing data, member 0 uses {}",
                    m,
                    cube.sentinel(),
                    first.sentinel()
                )));
            }
        }
        let verbosity = first.verbosity();

        let line_specific = first.line_specific_headers().cloned().map(|mut header| {
            for key in MEMBER_SPECIFIC_KEYS {
                header.remove(key);
            }
            header
        });

        Ok(Self {
            members,
            verbosity,
            line_specific,
            lookup: LazyField::new(),
            time_specific: LazyField::new(),
            combined: LazyField::new(),
        })
    }

    pub fn members(&self) -> &[DataCube] {
        &self.members
    }

    pub fn n_members(&self) -> usize {
        self.members.len()
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    // an emptied member contributes nothing instead of failing the whole cube
    fn member_len(&self, member: usize) -> Result<usize> {
        match self.members[member].n_steps() {
            Ok(n) => Ok(n),
            Err(CubeError::EmptyCube(reason)) => {
                warn!("member {} contributes no images: {}", member, reason);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Steps contributed by each member
    pub fn member_step_counts(&self) -> Result<Vec<usize>> {
        (0..self.members.len()).map(|m| self.member_len(m)).collect()
    }

    fn lookup(&self) -> Result<Arc<Vec<(usize, usize)>>> {
        self.lookup.get_or_try_init(|| {
            let mut lookup = Vec::new();
            for (member, n) in self.member_step_counts()?.into_iter().enumerate() {
                lookup.extend((0..n).map(|local| (member, local)));
            }
            Ok(lookup)
        })
    }

    fn invalidate(&self) {
        self.lookup.invalidate();
        self.time_specific.invalidate();
        self.combined.invalidate();
    }

    /// `(member, local step)` of a combined step
    pub fn whereat(&self, step: usize) -> Result<(usize, usize)> {
        let lookup = self.lookup()?;
        lookup.get(step).copied().ok_or_else(|| {
            CubeError::OutOfRange(format!("step {} outside 0..{}", step, lookup.len()))
        })
    }

    pub fn n_steps(&self) -> Result<usize> {
        Ok(self.lookup()?.len())
    }

    pub fn shape(&self) -> Result<(usize, usize, usize)> {
        let frame = self.frame();
        Ok((self.n_steps()?, frame.height(), frame.width()))
    }

    fn frame(&self) -> Bounds {
        let layout = self.members[0].layout();
        self.members[0]
            .bounds()
            .unwrap_or_else(|| Bounds::full(layout.height, layout.width))
    }

    pub fn is_cropped(&self) -> bool {
        self.members[0].is_cropped()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.members[0].bounds()
    }

    pub fn is_closed(&self) -> bool {
        self.members.iter().any(DataCube::is_closed)
    }

    pub fn get_image_step(&self, step: usize, divide_by_exptime: bool) -> Result<Array2<f32>> {
        let (member, local) = self.whereat(step)?;
        self.members[member].get_image_step(local, None, divide_by_exptime)
    }

    pub fn get_nsatpix(&self, step: usize) -> Result<usize> {
        let (member, local) = self.whereat(step)?;
        self.members[member].get_nsatpix(local)
    }

    /// Steps taken at `raster_pos`, summed over members
    pub fn get_raster_pos_steps(&self, raster_pos: usize) -> Result<usize> {
        let counts = self.member_step_counts()?;
        let mut total = 0;
        for (cube, n) in self.members.iter().zip(counts) {
            if n > 0 {
                total += cube.get_raster_pos_steps(raster_pos)?;
            }
        }
        Ok(total)
    }

    /// Bulk read across member boundaries, rows and cols relative to the crop rectangle
    pub fn slice(
        &self,
        steps: Range<usize>,
        rows: Range<usize>,
        cols: Range<usize>,
    ) -> Result<CubeSlice> {
        let lookup = self.lookup()?;
        if steps.is_empty() || steps.end > lookup.len() {
            return Err(CubeError::OutOfRange(format!(
                "steps {:?} outside 0..{}",
                steps,
                lookup.len()
            )));
        }

        // consecutive combined steps of one member are consecutive locally
        let mut runs: Vec<(usize, Range<usize>)> = Vec::new();
        for &(member, local) in &lookup[steps] {
            match runs.last_mut() {
                Some((m, run)) if *m == member => run.end = local + 1,
                _ => runs.push((member, local..local + 1)),
            }
        }

        let mut parts = Vec::with_capacity(runs.len());
        for (member, run) in runs {
            parts.push(
                self.members[member]
                    .slice(run, rows.clone(), cols.clone())?
                    .into_stack(),
            );
        }
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        let stack = ndarray::concatenate(Axis(0), &views)
            .map_err(|e| CubeError::InvalidBounds(e.to_string()))?;
        if stack.len_of(Axis(0)) == 1 {
            Ok(CubeSlice::Image(stack.index_axis_move(Axis(0), 0)))
        } else {
            Ok(CubeSlice::Stack(stack))
        }
    }

    pub fn primary_headers(&self) -> Result<Arc<Header>> {
        self.members[0].primary_headers()
    }

    /// Line-specific header of the first member without member-specific pointing keys
    pub fn line_specific_headers(&self) -> Option<&Header> {
        self.line_specific.as_ref()
    }

    pub fn time_specific_header(&self, step: usize) -> Result<Header> {
        let (member, local) = self.whereat(step)?;
        self.members[member].time_specific_header(local)
    }

    pub fn time_specific_headers(&self) -> Result<Arc<Vec<Header>>> {
        self.time_specific
            .get_or_try_init(|| self.concat_members(|cube| cube.time_specific_headers()))
    }

    pub fn headers(&self) -> Result<Arc<Vec<Header>>> {
        self.combined
            .get_or_try_init(|| self.concat_members(|cube| cube.headers()))
    }

    pub fn get_timestamps(&self) -> Result<Vec<f64>> {
        let mut stamps = Vec::new();
        for (cube, n) in self.members.iter().zip(self.member_step_counts()?) {
            if n > 0 {
                stamps.extend(cube.get_timestamps()?);
            }
        }
        Ok(stamps)
    }

    fn concat_members(
        &self,
        per_member: impl Fn(&DataCube) -> Result<Arc<Vec<Header>>>,
    ) -> Result<Vec<Header>> {
        let mut headers = Vec::new();
        for (cube, n) in self.members.iter().zip(self.member_step_counts()?) {
            if n > 0 {
                headers.extend(per_member(cube)?.iter().cloned());
            }
        }
        Ok(headers)
    }

    /// Delete combined steps from their owning members
    ///
    /// Every index is checked before any member changes. Fails if an index
    /// is out of range or no step would be left in the combined cube.
    pub fn remove_image_steps(&mut self, steps: &[usize]) -> Result<()> {
        let lookup = self.lookup()?;
        let mut per_member: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &step in steps {
            let &(member, local) = lookup.get(step).ok_or_else(|| {
                CubeError::OutOfRange(format!(
                    "cannot remove step {} from a cube with {} steps",
                    step,
                    lookup.len()
                ))
            })?;
            per_member.entry(member).or_default().push(local);
        }
        for locals in per_member.values_mut() {
            locals.sort_unstable();
            locals.dedup();
        }
        let removed: usize = per_member.values().map(Vec::len).sum();
        if removed >= lookup.len() {
            return Err(CubeError::EmptyCube(format!(
                "removing {} step(s) would leave no images",
                removed
            )));
        }

        for (member, locals) in per_member {
            self.members[member].remove_steps_allow_empty(&locals)?;
        }
        self.invalidate();
        Ok(())
    }

    /// Set the same crop rectangle on every member
    pub fn set_bounds(&mut self, bounds: Bounds) -> Result<()> {
        for cube in &self.members {
            if cube.is_closed() {
                return Err(CubeError::Closed);
            }
            bounds.validate(cube.layout().height, cube.layout().width)?;
        }
        for cube in &mut self.members {
            cube.set_bounds(bounds)?;
        }
        self.invalidate();
        Ok(())
    }

    pub fn reset_bounds(&mut self) {
        for cube in &mut self.members {
            cube.reset_bounds();
        }
        self.invalidate();
    }

    pub fn crop(&mut self, remove_bad: bool, check_coverage: bool) -> Result<Option<CubeFit>> {
        let cropper = CubeCropper::new(
            CropConfig::default()
                .with_sentinel(self.members[0].sentinel())
                .with_check_coverage(check_coverage),
        );
        self.crop_with(&cropper, remove_bad, None)
    }

    pub fn crop_with(
        &mut self,
        cropper: &CubeCropper,
        remove_bad: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<CubeFit>> {
        cropper.check_sentinel(self.members[0].sentinel())?;
        cropper.fit_transform(self, remove_bad, cancel)
    }

    pub fn close(&mut self) {
        for cube in &mut self.members {
            cube.close();
        }
    }

    pub fn reopen(&mut self) -> Result<()> {
        for cube in &mut self.members {
            cube.reopen()?;
        }
        Ok(())
    }
}

impl ImageSource for CombinedCube {
    fn n_steps(&self) -> Result<usize> {
        CombinedCube::n_steps(self)
    }

    fn read_image(&self, step: usize) -> Result<Array2<f32>> {
        self.get_image_step(step, false)
    }

    fn modality(&self) -> Modality {
        self.members[0].info().modality
    }

    fn observation_mode(&self) -> ObservationMode {
        self.members[0].info().mode
    }
}

impl CroppableCube for CombinedCube {
    fn is_cropped(&self) -> bool {
        CombinedCube::is_cropped(self)
    }

    fn apply_crop(&mut self, fit: &CubeFit, remove_bad: bool) -> Result<()> {
        for cube in &self.members {
            fit.bounds.validate(cube.layout().height, cube.layout().width)?;
        }
        let removed = if remove_bad { fit.removed_steps() } else { Vec::new() };
        if !removed.is_empty() {
            self.remove_image_steps(&removed)?;
        }
        self.set_bounds(fit.bounds)?;
        if self.verbosity.interactive() {
            info!(
                "cropped combined cube to {:?}, removed {} step(s)",
                fit.bounds.as_array(),
                removed.len()
            );
        }
        Ok(())
    }
}
