//! IRIScube - out-of-core access to multi-file solar imaging observations
//!
//! Observations are stored as many files, each holding a stack of images plus
//! a table of per-image records. This crate presents one channel of such an
//! observation as a single virtual `(step, y, x)` cube without ever loading
//! a whole stack into memory.
//!
//! # Features
//!
//! - Bounded pool of open files with volatile/persistent eviction and
//!   automatic recovery from descriptor exhaustion
//! - Lazily built step index tables, cached on disk between sessions
//! - Slit-jaw and spectrograph header handling through pluggable policies
//! - Robust cropping of missing-data borders with outlier rejection
//! - Concatenation of several cubes into one combined cube
//!
//! # Example
//!
//! ```rust,ignore
//! use iriscube::{CubeOptions, DataCube, FileHub, ReaderConfig};
//! use std::sync::Arc;
//!
//! # fn example() -> iriscube::Result<()> {
//! let config = ReaderConfig::default();
//! let hub = Arc::new(FileHub::new(&config));
//! let mut cube = DataCube::open(
//!     vec!["raster_t000.irc".into(), "raster_t001.irc".into()],
//!     CubeOptions::new("Mg II k"),
//!     hub,
//!     &config,
//! )?;
//!
//! cube.crop(true, true)?;
//! let image = cube.get_image_step(0, None, true)?;
//! # Ok(())
//! # }
//! ```

pub mod combined;
pub mod compression;
pub mod config;
pub mod container;
pub mod crop;
pub mod cube;
pub mod error;
pub mod header;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod pool;
pub mod types;
pub mod utils;

// Re-exports
pub use combined::CombinedCube;
pub use compression::{CompressionMethod, Compressor};
pub use config::{CropConfig, ReaderConfig, Verbosity};
pub use container::{ContainerFile, ContainerWriter, ImageFile};
pub use crop::{CroppableCube, CubeCropper, CubeFit, ImageCropper, ImageSource};
pub use cube::{CubeOptions, CubeSlice, DataCube};
pub use error::{CubeError, Result};
pub use header::{Header, HeaderPolicy, HeaderValue};
pub use io::{
    CacheKey, FileSystemIndexCache, IndexCache, MemberStamp, MemoryIndexCache, NoIndexCache,
};
pub use layout::StepIndexTable;
pub use metadata::{CubeLayout, ObservationInfo};
pub use pool::{FileHub, FilePool};
pub use types::{Bounds, Modality, ObservationMode, PoolMode, StepIndexEntry};
pub use utils::CancelToken;

/// Version of the iriscube implementation
pub const IRISCUBE_VERSION: &str = env!("CARGO_PKG_VERSION");
