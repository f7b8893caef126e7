//! Bounded pool of open observation files
//!
//! Observations can span thousands of files while the operating system caps
//! the number of open descriptors. [`FilePool`] keeps at most `max_size`
//! handles resident and evicts the oldest volatile one when full. [`FileHub`]
//! is the shareable, locked front-end that also recovers from descriptor
//! exhaustion by halving its capacity and retrying once.

use crate::config::{ReaderConfig, Verbosity};
use crate::container::{ContainerOpener, FileOpener, ImageFile};
use crate::error::Result;
use crate::types::PoolMode;
use log::{info, trace, warn};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct PoolEntry {
    path: PathBuf,
    handle: Arc<dyn ImageFile>,
    mode: PoolMode,
}

/// Resident file handles in opening order
pub struct FilePool {
    entries: Vec<PoolEntry>,
    max_size: usize,
    use_memmap: bool,
    verbosity: Verbosity,
    opener: Arc<dyn FileOpener>,
}

impl FilePool {
    pub fn new(config: &ReaderConfig, opener: Arc<dyn FileOpener>) -> Self {
        Self {
            entries: Vec::new(),
            max_size: config.max_open_files.max(1),
            use_memmap: config.use_memmap,
            verbosity: config.verbosity(),
            opener,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.position(path).is_some()
    }

    /// Retention mode of a resident path
    pub fn mode_of(&self, path: &Path) -> Option<PoolMode> {
        self.position(path).map(|i| self.entries[i].mode)
    }

    /// Resident paths, oldest first
    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }

    fn position(&self, path: &Path) -> Option<usize> {
        self.entries.iter().position(|e| e.path == path)
    }

    /// Return the handle for `path`, opening it if it is not resident
    ///
    /// A resident entry only has its mode updated. Otherwise a full pool
    /// evicts first, then the file is opened and appended.
    pub fn open(&mut self, path: &Path, mode: PoolMode) -> Result<Arc<dyn ImageFile>> {
        if let Some(i) = self.position(path) {
            self.entries[i].mode = mode;
            return Ok(Arc::clone(&self.entries[i].handle));
        }

        while self.entries.len() >= self.max_size {
            self.evict_one();
        }

        let handle = self.opener.open(path, self.use_memmap)?;
        if self.verbosity.unfiltered() {
            trace!("pool push {} ({})", path.display(), mode);
        }
        self.entries.push(PoolEntry {
            path: path.to_path_buf(),
            handle: Arc::clone(&handle),
            mode,
        });
        Ok(handle)
    }

    fn evict_one(&mut self) {
        let victim = match self
            .entries
            .iter()
            .position(|e| e.mode == PoolMode::Volatile)
        {
            Some(i) => i,
            None => {
                warn!(
                    "file pool saturated with persistent entries ({}), evicting the oldest",
                    self.max_size
                );
                0
            }
        };
        let entry = self.entries.remove(victim);
        self.drop_entry(entry);
    }

    fn drop_entry(&self, entry: PoolEntry) {
        if self.verbosity.unfiltered() {
            trace!("pool drop {} ({})", entry.path.display(), entry.mode);
        }
        entry.handle.release();
    }

    /// Release and forget `path`; no-op if it is not resident
    pub fn close(&mut self, path: &Path) {
        if let Some(i) = self.position(path) {
            let entry = self.entries.remove(i);
            self.drop_entry(entry);
        }
    }

    /// Close every resident handle
    pub fn reset(&mut self) {
        for entry in std::mem::take(&mut self.entries) {
            self.drop_entry(entry);
        }
    }

    /// Close everything and adopt a new capacity
    pub fn reset_with_max_size(&mut self, max_size: usize) {
        self.reset();
        self.max_size = max_size.max(1);
    }
}

/// Snapshot of the pool for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSummary {
    pub resident: usize,
    pub persistent: usize,
    pub max_size: usize,
}

/// Thread-safe pool front-end shared by all cubes of a session
pub struct FileHub {
    pool: Mutex<FilePool>,
}

impl FileHub {
    /// Hub over native container files
    pub fn new(config: &ReaderConfig) -> Self {
        Self::with_opener(config, Arc::new(ContainerOpener))
    }

    pub fn with_opener(config: &ReaderConfig, opener: Arc<dyn FileOpener>) -> Self {
        Self {
            pool: Mutex::new(FilePool::new(config, opener)),
        }
    }

    pub fn open(&self, path: &Path, mode: PoolMode) -> Result<Arc<dyn ImageFile>> {
        self.remediate(|| self.pool.lock().open(path, mode))
    }

    /// Run `f` on the handle for `path`
    ///
    /// The pool lock is not held while `f` runs. Descriptor exhaustion
    /// inside `f` is remediated like a failed open.
    pub fn with_file<T>(
        &self,
        path: &Path,
        mode: PoolMode,
        f: impl Fn(&dyn ImageFile) -> Result<T>,
    ) -> Result<T> {
        self.remediate(|| {
            let handle = self.pool.lock().open(path, mode)?;
            f(handle.as_ref())
        })
    }

    fn remediate<T>(&self, op: impl Fn() -> Result<T>) -> Result<T> {
        match op() {
            Err(e) if e.is_too_many_open_files() => {
                let mut pool = self.pool.lock();
                let halved = (pool.max_size() / 2).max(1);
                info!(
                    "too many open files, shrinking file pool from {} to {}",
                    pool.max_size(),
                    halved
                );
                pool.reset_with_max_size(halved);
                drop(pool);
                op()
            }
            other => other,
        }
    }

    pub fn close(&self, path: &Path) {
        self.pool.lock().close(path);
    }

    pub fn reset(&self) {
        self.pool.lock().reset();
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.pool.lock().contains(path)
    }

    pub fn mode_of(&self, path: &Path) -> Option<PoolMode> {
        self.pool.lock().mode_of(path)
    }

    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.lock().is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.pool.lock().max_size()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.pool.lock().paths()
    }

    pub fn summary(&self) -> PoolSummary {
        let pool = self.pool.lock();
        PoolSummary {
            resident: pool.len(),
            persistent: pool
                .entries
                .iter()
                .filter(|e| e.mode == PoolMode::Persistent)
                .count(),
            max_size: pool.max_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ExtensionInfo;
    use crate::error::CubeError;
    use ndarray::Array2;
    use std::ops::Range;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeFile {
        path: PathBuf,
        released: AtomicBool,
        extensions: Vec<ExtensionInfo>,
    }

    impl ImageFile for FakeFile {
        fn path(&self) -> &Path {
            &self.path
        }

        fn n_extensions(&self) -> usize {
            self.extensions.len()
        }

        fn extension(&self, index: usize) -> Result<&ExtensionInfo> {
            self.extensions
                .get(index)
                .ok_or_else(|| CubeError::OutOfRange(index.to_string()))
        }

        fn read_plane(
            &self,
            _ext: usize,
            _index: usize,
            rows: Range<usize>,
            cols: Range<usize>,
        ) -> Result<Array2<f32>> {
            if self.released.load(Ordering::SeqCst) {
                return Err(CubeError::Closed);
            }
            Ok(Array2::zeros((rows.len(), cols.len())))
        }

        fn read_table(&self, _ext: usize) -> Result<Array2<f64>> {
            Ok(Array2::zeros((0, 0)))
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Opener that fails with EMFILE for the first `failures` calls
    #[derive(Default)]
    struct FakeOpener {
        failures: AtomicUsize,
        opened: AtomicUsize,
    }

    impl FileOpener for FakeOpener {
        fn open(&self, path: &Path, _use_memmap: bool) -> Result<Arc<dyn ImageFile>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(std::io::Error::from_raw_os_error(24).into());
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeFile {
                path: path.to_path_buf(),
                released: AtomicBool::new(false),
                extensions: Vec::new(),
            }))
        }
    }

    fn pool(max: usize) -> FilePool {
        FilePool::new(
            &ReaderConfig::default().with_max_open_files(max),
            Arc::new(FakeOpener::default()),
        )
    }

    #[test]
    fn test_eviction_prefers_volatile() {
        let mut pool = pool(2);
        pool.open(Path::new("A"), PoolMode::Persistent).unwrap();
        pool.open(Path::new("B"), PoolMode::Volatile).unwrap();
        pool.open(Path::new("C"), PoolMode::Volatile).unwrap();
        assert_eq!(pool.paths(), vec![PathBuf::from("A"), PathBuf::from("C")]);
    }

    #[test]
    fn test_saturated_pool_evicts_oldest() {
        let mut pool = pool(2);
        pool.open(Path::new("A"), PoolMode::Persistent).unwrap();
        pool.open(Path::new("B"), PoolMode::Persistent).unwrap();
        pool.open(Path::new("C"), PoolMode::Volatile).unwrap();
        assert_eq!(pool.paths(), vec![PathBuf::from("B"), PathBuf::from("C")]);
    }

    #[test]
    fn test_reopen_updates_mode_without_reopening() {
        let opener = Arc::new(FakeOpener::default());
        let mut pool = FilePool::new(&ReaderConfig::default(), opener.clone());
        let first = pool.open(Path::new("A"), PoolMode::Volatile).unwrap();
        let second = pool.open(Path::new("A"), PoolMode::Persistent).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.mode_of(Path::new("A")), Some(PoolMode::Persistent));
        assert_eq!(opener.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut pool = pool(3);
        for i in 0..20 {
            let mode = if i % 4 == 0 {
                PoolMode::Persistent
            } else {
                PoolMode::Volatile
            };
            pool.open(Path::new(&format!("f{}", i % 7)), mode).unwrap();
            if i % 5 == 0 {
                pool.close(Path::new(&format!("f{}", i % 3)));
            }
            assert!(pool.len() <= 3);
        }
    }

    #[test]
    fn test_close_releases_handle() {
        let mut pool = pool(4);
        let handle = pool.open(Path::new("A"), PoolMode::Volatile).unwrap();
        pool.close(Path::new("A"));
        pool.close(Path::new("missing"));
        assert!(pool.is_empty());
        assert!(matches!(
            handle.read_plane(0, 0, 0..1, 0..1),
            Err(CubeError::Closed)
        ));
    }

    #[test]
    fn test_hub_halves_and_retries_once() {
        let opener = Arc::new(FakeOpener::default());
        opener.failures.store(1, Ordering::SeqCst);
        let hub = FileHub::with_opener(&ReaderConfig::default().with_max_open_files(8), opener.clone());
        hub.open(Path::new("A"), PoolMode::Volatile).unwrap();
        assert_eq!(hub.max_size(), 4);
        assert_eq!(hub.len(), 1);

        // a second consecutive failure propagates
        opener.failures.store(2, Ordering::SeqCst);
        let err = hub.open(Path::new("B"), PoolMode::Volatile).err().unwrap();
        assert!(err.is_too_many_open_files());
        assert_eq!(hub.max_size(), 2);
    }

    #[test]
    fn test_hub_summary() {
        let hub = FileHub::with_opener(&ReaderConfig::default(), Arc::new(FakeOpener::default()));
        hub.open(Path::new("A"), PoolMode::Persistent).unwrap();
        hub.with_file(Path::new("B"), PoolMode::Volatile, |f| f.read_plane(0, 0, 0..2, 0..3))
            .unwrap();
        assert_eq!(
            hub.summary(),
            PoolSummary {
                resident: 2,
                persistent: 1,
                max_size: 256
            }
        );
        hub.reset();
        assert!(hub.is_empty());
    }
}
