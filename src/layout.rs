//! Step index table - maps logical steps onto physical files

use crate::error::{CubeError, Result};
use crate::types::StepIndexEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;

/// Ordered `(file_id, local_step, raster_pos)` rows, one per logical step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepIndexTable {
    rows: Vec<StepIndexEntry>,
}

/// A run of consecutive logical steps that live in the same file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRun {
    pub file_id: usize,
    /// Logical steps covered by this run
    pub steps: Range<usize>,
}

impl StepIndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table straight from per-file step counts, without reading pixels
    ///
    /// Files with a count of zero contribute no rows.
    pub fn from_step_counts(counts: &[usize], n_raster_positions: usize) -> Self {
        let positions = n_raster_positions.max(1);
        let rows = counts
            .iter()
            .enumerate()
            .flat_map(|(file_id, &count)| {
                (0..count).map(move |local| StepIndexEntry::new(file_id, local, local % positions))
            })
            .collect();
        Self { rows }
    }

    pub fn push(&mut self, entry: StepIndexEntry) {
        self.rows.push(entry);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[StepIndexEntry] {
        &self.rows
    }

    pub fn get(&self, step: usize) -> Result<StepIndexEntry> {
        self.rows.get(step).copied().ok_or_else(|| {
            CubeError::OutOfRange(format!(
                "step {} outside 0..{}",
                step,
                self.rows.len()
            ))
        })
    }

    /// Logical steps taken at `raster_pos`, in order
    pub fn steps_at_raster_pos(&self, raster_pos: usize) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.raster_pos == raster_pos)
            .map(|(step, _)| step)
            .collect()
    }

    /// Resolve the `step`-th image taken at `raster_pos`
    pub fn get_at_raster_pos(&self, step: usize, raster_pos: usize) -> Result<(usize, StepIndexEntry)> {
        let steps = self.steps_at_raster_pos(raster_pos);
        let logical = steps.get(step).copied().ok_or_else(|| {
            CubeError::OutOfRange(format!(
                "step {} outside 0..{} at raster position {}",
                step,
                steps.len(),
                raster_pos
            ))
        })?;
        Ok((logical, self.rows[logical]))
    }

    /// Number of rows belonging to each of `n_files` files
    pub fn step_counts(&self, n_files: usize) -> Vec<usize> {
        let mut counts = vec![0; n_files];
        for row in &self.rows {
            if let Some(count) = counts.get_mut(row.file_id) {
                *count += 1;
            }
        }
        counts
    }

    /// Split a logical range into runs of consecutive rows sharing a file
    pub fn group_by_file(&self, steps: Range<usize>) -> Result<Vec<FileRun>> {
        if steps.start > steps.end || steps.end > self.rows.len() {
            return Err(CubeError::OutOfRange(format!(
                "steps {:?} outside 0..{}",
                steps,
                self.rows.len()
            )));
        }
        let mut runs: Vec<FileRun> = Vec::new();
        for step in steps {
            let file_id = self.rows[step].file_id;
            match runs.last_mut() {
                Some(run) if run.file_id == file_id => run.steps.end = step + 1,
                _ => runs.push(FileRun {
                    file_id,
                    steps: step..step + 1,
                }),
            }
        }
        Ok(runs)
    }

    /// Delete logical rows; survivors keep their physical coordinates
    ///
    /// Duplicate indices are ignored. Fails without touching the table if any
    /// index is out of range.
    pub fn remove_rows(&mut self, steps: &[usize]) -> Result<usize> {
        if let Some(&bad) = steps.iter().find(|&&s| s >= self.rows.len()) {
            return Err(CubeError::OutOfRange(format!(
                "cannot remove step {} from a table with {} steps",
                bad,
                self.rows.len()
            )));
        }
        let doomed: HashSet<usize> = steps.iter().copied().collect();
        let mut step = 0;
        self.rows.retain(|_| {
            let keep = !doomed.contains(&step);
            step += 1;
            keep
        });
        Ok(doomed.len())
    }

    /// Check the table against the member files it indexes
    ///
    /// Every `(file_id, local_step)` pair must be unique, every `file_id` must
    /// name one of `n_files` files and rows must follow file order.
    pub fn validate(&self, n_files: usize) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.rows.len());
        let mut previous: Option<(usize, usize)> = None;
        for row in &self.rows {
            if row.file_id >= n_files {
                return Err(CubeError::Serialization(format!(
                    "row references file {} of {}",
                    row.file_id, n_files
                )));
            }
            if !seen.insert((row.file_id, row.local_step)) {
                return Err(CubeError::Serialization(format!(
                    "duplicate row ({}, {})",
                    row.file_id, row.local_step
                )));
            }
            if let Some(prev) = previous {
                if (row.file_id, row.local_step) < prev {
                    return Err(CubeError::Serialization(format!(
                        "row ({}, {}) breaks file order",
                        row.file_id, row.local_step
                    )));
                }
            }
            previous = Some((row.file_id, row.local_step));
        }
        Ok(())
    }
}

impl FromIterator<StepIndexEntry> for StepIndexTable {
    fn from_iter<I: IntoIterator<Item = StepIndexEntry>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}
