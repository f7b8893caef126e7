//! Persisted step index tables
//!
//! Building a step index table may require reading every frame of every
//! member file. The result is cached per cube, keyed by channel and by the
//! null-frame handling mode. The storage medium is pluggable through
//! [`IndexCache`].
//!
//! Cubes of one channel in one directory share a cache file name, so every
//! stored table carries a fingerprint of the files it was built from and of
//! the missing-data value. A table with another fingerprint is a miss.

use crate::compression::{decode_frame, encode_frame, CompressionMethod};
use crate::config::DEFAULT_SENTINEL;
use crate::error::Result;
use crate::layout::StepIndexTable;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Magic number of persisted index blobs
pub const INDEX_MAGIC: &[u8; 4] = b"SIX\0";

/// Name, size and modification time of one member file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberStamp {
    pub name: String,
    pub len: u64,
    /// Milliseconds since the Unix epoch
    pub modified: i64,
}

impl MemberStamp {
    /// Stamp `path`; unreadable metadata stamps as zero size and time
    pub fn of(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (len, modified) = match std::fs::metadata(path) {
            Ok(meta) => (
                meta.len(),
                meta.modified()
                    .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
                    .unwrap_or(0),
            ),
            Err(_) => (0, 0),
        };
        Self {
            name,
            len,
            modified,
        }
    }
}

/// Identifies one cached step index table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Directory holding the cube's files
    pub directory: PathBuf,
    /// Resolved channel description
    pub channel: String,
    /// Whether null frames are kept
    pub keep_null: bool,
    /// Member files, in cube order
    pub members: Vec<MemberStamp>,
    /// Bit pattern of the missing-data value
    pub sentinel_bits: u32,
}

impl CacheKey {
    pub fn new(directory: impl Into<PathBuf>, channel: impl Into<String>, keep_null: bool) -> Self {
        Self {
            directory: directory.into(),
            channel: channel.into(),
            keep_null,
            members: Vec::new(),
            sentinel_bits: DEFAULT_SENTINEL.to_bits(),
        }
    }

    /// Stamp the member files of the cube
    pub fn with_members<P: AsRef<Path>>(mut self, files: &[P]) -> Self {
        self.members = files.iter().map(|f| MemberStamp::of(f.as_ref())).collect();
        self
    }

    pub fn with_sentinel(mut self, sentinel: f32) -> Self {
        self.sentinel_bits = sentinel.to_bits();
        self
    }

    /// Deterministic cache file name
    pub fn file_name(&self) -> String {
        let channel: String = self
            .channel
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let mode = if self.keep_null { "keep" } else { "drop" };
        format!(".iriscube_{}_{}.idx", channel, mode)
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(self.file_name())
    }
}

/// On-disk form of a cached table
#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    members: Vec<MemberStamp>,
    sentinel_bits: u32,
    table: StepIndexTable,
}

/// Storage for step index tables
pub trait IndexCache: Send + Sync {
    /// Look up a table; `Ok(None)` on a miss
    fn load(&self, key: &CacheKey) -> Result<Option<StepIndexTable>>;

    fn store(&self, key: &CacheKey, table: &StepIndexTable) -> Result<()>;

    fn invalidate(&self, key: &CacheKey) -> Result<()>;
}

/// Cache files next to the observation files
pub struct FileSystemIndexCache {
    compression: CompressionMethod,
}

impl FileSystemIndexCache {
    pub fn new(compression: CompressionMethod) -> Self {
        Self { compression }
    }
}

impl Default for FileSystemIndexCache {
    fn default() -> Self {
        Self::new(CompressionMethod::Zstd)
    }
}

impl IndexCache for FileSystemIndexCache {
    fn load(&self, key: &CacheKey) -> Result<Option<StepIndexTable>> {
        let path = key.path();
        if !path.exists() {
            return Ok(None);
        }
        let frame = std::fs::read(&path)?;
        let payload = decode_frame(INDEX_MAGIC, &frame)?;
        let persisted: PersistedIndex = bincode::deserialize(&payload)?;
        if persisted.members != key.members || persisted.sentinel_bits != key.sentinel_bits {
            debug!("{} was built from other files, ignoring it", path.display());
            return Ok(None);
        }
        let table = persisted.table;
        debug!("loaded step index table ({} rows) from {}", table.len(), path.display());
        Ok(Some(table))
    }

    fn store(&self, key: &CacheKey, table: &StepIndexTable) -> Result<()> {
        let payload = bincode::serialize(&PersistedIndex {
            members: key.members.clone(),
            sentinel_bits: key.sentinel_bits,
            table: table.clone(),
        })?;
        let frame = encode_frame(INDEX_MAGIC, self.compression, &payload)?;
        write_atomic(&key.path(), &frame)
    }

    fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let path = key.path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("idx.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Process-local cache
#[derive(Default)]
pub struct MemoryIndexCache {
    tables: RwLock<HashMap<CacheKey, StepIndexTable>>,
}

impl MemoryIndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

impl IndexCache for MemoryIndexCache {
    fn load(&self, key: &CacheKey) -> Result<Option<StepIndexTable>> {
        Ok(self.tables.read().get(key).cloned())
    }

    fn store(&self, key: &CacheKey, table: &StepIndexTable) -> Result<()> {
        self.tables.write().insert(key.clone(), table.clone());
        Ok(())
    }

    fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.tables.write().remove(key);
        Ok(())
    }
}

/// Never caches anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndexCache;

impl IndexCache for NoIndexCache {
    fn load(&self, _key: &CacheKey) -> Result<Option<StepIndexTable>> {
        Ok(None)
    }

    fn store(&self, _key: &CacheKey, _table: &StepIndexTable) -> Result<()> {
        Ok(())
    }

    fn invalidate(&self, _key: &CacheKey) -> Result<()> {
        Ok(())
    }
}

/// Load a table and check it against the cube it belongs to
///
/// Read failures and inconsistent tables are logged and reported as a miss.
pub(crate) fn load_checked(
    cache: &dyn IndexCache,
    key: &CacheKey,
    n_files: usize,
) -> Option<StepIndexTable> {
    match cache.load(key) {
        Ok(Some(table)) => match table.validate(n_files) {
            Ok(()) => Some(table),
            Err(e) => {
                warn!("discarding cached step index {}: {}", key.file_name(), e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("could not read cached step index {}: {}", key.file_name(), e);
            None
        }
    }
}
