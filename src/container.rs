//! Physical observation files
//!
//! A container holds a primary header plus a list of extensions. Every
//! extension carries a shape, a header dictionary and a payload:
//!
//! ```text
//! "IRC\0" | version: u32 LE | layout length: u64 LE | layout (JSON) | payloads
//! ```
//!
//! Image stacks are stored raw and little-endian so single planes can be read
//! without touching the rest of the stack. Record tables may be compressed.

use crate::compression::{get_compressor, CompressionMethod};
use crate::error::{CubeError, Result};
use crate::header::Header;
use crate::types::DataType;
use memmap2::Mmap;
use ndarray::{Array2, Array3};
use num_traits::AsPrimitive;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic number of the container format
pub const CONTAINER_MAGIC: &[u8; 4] = b"IRC\0";

/// Current container format version
pub const CONTAINER_VERSION: u32 = 1;

const PREAMBLE_LEN: u64 = 16;

/// Shape and header of one extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    /// Array shape, slowest axis first; empty for header-only extensions
    pub shape: Vec<usize>,
    pub header: Header,
    pub data_type: DataType,
}

impl ExtensionInfo {
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn n_elements(&self) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            self.shape.iter().fold(1, |acc: usize, &d| acc.saturating_mul(d))
        }
    }

    /// Decoded payload size; `None` when it does not fit in `usize`
    pub fn byte_len(&self) -> Option<usize> {
        if self.shape.is_empty() {
            return Some(0);
        }
        self.shape
            .iter()
            .try_fold(self.data_type.size_in_bytes(), |acc, &d| acc.checked_mul(d))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExtensionDescriptor {
    info: ExtensionInfo,
    offset: u64,
    length: u64,
    compression: CompressionMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContainerLayout {
    extensions: Vec<ExtensionDescriptor>,
}

/// Handle on an open observation file
pub trait ImageFile: Send + Sync {
    fn path(&self) -> &Path;

    fn n_extensions(&self) -> usize;

    fn extension(&self, index: usize) -> Result<&ExtensionInfo>;

    /// Read `rows x cols` of plane `index` of a three-dimensional extension
    fn read_plane(
        &self,
        ext: usize,
        index: usize,
        rows: Range<usize>,
        cols: Range<usize>,
    ) -> Result<Array2<f32>>;

    /// Read a whole two-dimensional extension
    fn read_table(&self, ext: usize) -> Result<Array2<f64>>;

    /// Drop mapped or buffered backing data; later reads fail with [`CubeError::Closed`]
    fn release(&self);
}

/// Opens physical files on behalf of the file pool
pub trait FileOpener: Send + Sync {
    fn open(&self, path: &Path, use_memmap: bool) -> Result<Arc<dyn ImageFile>>;
}

/// Opener for the native container format
#[derive(Debug, Default, Clone, Copy)]
pub struct ContainerOpener;

impl FileOpener for ContainerOpener {
    fn open(&self, path: &Path, use_memmap: bool) -> Result<Arc<dyn ImageFile>> {
        Ok(Arc::new(ContainerFile::open(path, use_memmap)?))
    }
}

enum Backing {
    Mapped(RwLock<Option<Mmap>>),
    Streamed(Mutex<Option<File>>),
}

/// An open container file
pub struct ContainerFile {
    path: PathBuf,
    extensions: Vec<ExtensionDescriptor>,
    payload_start: u64,
    backing: Backing,
}

impl ContainerFile {
    /// Open a container, either memory-mapped or for on-demand reads
    pub fn open(path: impl AsRef<Path>, use_memmap: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        let mut preamble = [0u8; PREAMBLE_LEN as usize];
        file.read_exact(&mut preamble)
            .map_err(|_| CubeError::corrupt(&path, "file too short for a container preamble"))?;
        if &preamble[..4] != CONTAINER_MAGIC {
            return Err(CubeError::corrupt(&path, "bad magic number"));
        }
        let version = u32::from_le_bytes([preamble[4], preamble[5], preamble[6], preamble[7]]);
        if version != CONTAINER_VERSION {
            return Err(CubeError::corrupt(
                &path,
                format!("unsupported container version {}", version),
            ));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&preamble[8..16]);
        let layout_len = u64::from_le_bytes(len_bytes);
        let payload_start = PREAMBLE_LEN
            .checked_add(layout_len)
            .filter(|&end| end <= file_len)
            .ok_or_else(|| CubeError::corrupt(&path, "layout overruns the file"))?;

        let mut layout_bytes = vec![0u8; layout_len as usize];
        file.read_exact(&mut layout_bytes)?;
        let layout: ContainerLayout = serde_json::from_slice(&layout_bytes)
            .map_err(|e| CubeError::corrupt(&path, format!("unreadable layout: {}", e)))?;

        validate_layout(&path, &layout, file_len - payload_start)?;

        let backing = if use_memmap {
            // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
            #[allow(unsafe_code)]
            let mmap = unsafe { Mmap::map(&file)? };
            Backing::Mapped(RwLock::new(Some(mmap)))
        } else {
            Backing::Streamed(Mutex::new(Some(file)))
        };

        Ok(Self {
            path,
            extensions: layout.extensions,
            payload_start,
            backing,
        })
    }

    pub fn is_memory_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    fn descriptor(&self, ext: usize) -> Result<&ExtensionDescriptor> {
        self.extensions.get(ext).ok_or_else(|| {
            CubeError::OutOfRange(format!(
                "extension {} of {} ({} extensions)",
                ext,
                self.path.display(),
                self.extensions.len()
            ))
        })
    }

    /// Run `f` on `len` payload bytes starting at `offset`
    fn with_bytes<R>(&self, offset: u64, len: usize, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        let start = self.payload_start + offset;
        match &self.backing {
            Backing::Mapped(mmap) => {
                let guard = mmap.read();
                let mmap = guard.as_ref().ok_or(CubeError::Closed)?;
                let start = start as usize;
                let bytes = mmap
                    .get(start..start + len)
                    .ok_or_else(|| CubeError::corrupt(&self.path, "read past end of file"))?;
                f(bytes)
            }
            Backing::Streamed(file) => {
                let mut guard = file.lock();
                let file = guard.as_mut().ok_or(CubeError::Closed)?;
                file.seek(SeekFrom::Start(start))?;
                let mut buffer = vec![0u8; len];
                file.read_exact(&mut buffer)?;
                f(&buffer)
            }
        }
    }
}

fn validate_layout(path: &Path, layout: &ContainerLayout, payload_len: u64) -> Result<()> {
    if layout.extensions.is_empty() {
        return Err(CubeError::corrupt(path, "container has no extensions"));
    }
    for (i, ext) in layout.extensions.iter().enumerate() {
        if ext.info.shape.iter().any(|&d| d == 0) {
            return Err(CubeError::corrupt(
                path,
                format!("extension {} has a zero-length axis", i),
            ));
        }
        let raw_len = ext
            .info
            .byte_len()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| {
                CubeError::corrupt(
                    path,
                    format!("extension {} shape {:?} is too large", i, ext.info.shape),
                )
            })?;
        // header-only extensions may carry any BITPIX
        let declared = ext
            .info
            .header
            .get("BITPIX")
            .and_then(|v| v.as_i64())
            .filter(|_| ext.info.n_elements() > 0);
        if let Some(bitpix) = declared {
            if DataType::from_bitpix(bitpix as i32) != Some(ext.info.data_type) {
                return Err(CubeError::corrupt(
                    path,
                    format!(
                        "extension {} declares BITPIX={} but stores {}",
                        i, bitpix, ext.info.data_type
                    ),
                ));
            }
        }
        if ext.compression == CompressionMethod::None && ext.length != raw_len {
            return Err(CubeError::corrupt(
                path,
                format!(
                    "extension {} stores {} bytes but its shape {:?} needs {}",
                    i, ext.length, ext.info.shape, raw_len
                ),
            ));
        }
        if ext.info.ndim() == 3 && ext.compression != CompressionMethod::None {
            return Err(CubeError::corrupt(
                path,
                format!("image stack extension {} must not be compressed", i),
            ));
        }
        let end = ext.offset.checked_add(ext.length);
        if end.map_or(true, |end| end > payload_len) {
            return Err(CubeError::corrupt(
                path,
                format!("extension {} overruns the file", i),
            ));
        }
    }
    Ok(())
}

fn decode_le<T, O, const N: usize>(bytes: &[u8], from: fn([u8; N]) -> T) -> Vec<O>
where
    T: AsPrimitive<O>,
    O: Copy + 'static,
{
    bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut raw = [0u8; N];
            raw.copy_from_slice(chunk);
            from(raw).as_()
        })
        .collect()
}

fn decode_values<O>(bytes: &[u8], data_type: DataType) -> Vec<O>
where
    O: Copy + 'static,
    u8: AsPrimitive<O>,
    i16: AsPrimitive<O>,
    i32: AsPrimitive<O>,
    i64: AsPrimitive<O>,
    f32: AsPrimitive<O>,
    f64: AsPrimitive<O>,
{
    match data_type {
        DataType::U8 => decode_le(bytes, u8::from_le_bytes),
        DataType::I16 => decode_le(bytes, i16::from_le_bytes),
        DataType::I32 => decode_le(bytes, i32::from_le_bytes),
        DataType::I64 => decode_le(bytes, i64::from_le_bytes),
        DataType::F32 => decode_le(bytes, f32::from_le_bytes),
        DataType::F64 => decode_le(bytes, f64::from_le_bytes),
    }
}

fn check_range(range: &Range<usize>, extent: usize, axis: &str) -> Result<()> {
    if range.start > range.end || range.end > extent {
        return Err(CubeError::OutOfRange(format!(
            "{} range {:?} outside 0..{}",
            axis, range, extent
        )));
    }
    Ok(())
}

impl ImageFile for ContainerFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn n_extensions(&self) -> usize {
        self.extensions.len()
    }

    fn extension(&self, index: usize) -> Result<&ExtensionInfo> {
        Ok(&self.descriptor(index)?.info)
    }

    fn read_plane(
        &self,
        ext: usize,
        index: usize,
        rows: Range<usize>,
        cols: Range<usize>,
    ) -> Result<Array2<f32>> {
        let desc = self.descriptor(ext)?;
        let shape = &desc.info.shape;
        if shape.len() != 3 {
            return Err(CubeError::corrupt(
                &self.path,
                format!("extension {} is not an image stack", ext),
            ));
        }
        let (depth, height, width) = (shape[0], shape[1], shape[2]);
        if index >= depth {
            return Err(CubeError::OutOfRange(format!(
                "plane {} of a stack with {} planes",
                index, depth
            )));
        }
        check_range(&rows, height, "row")?;
        check_range(&cols, width, "column")?;

        let elem = desc.info.data_type.size_in_bytes();
        let plane_start = (index * height * width * elem) as u64;
        let block_start = desc.offset + plane_start + (rows.start * width * elem) as u64;
        let block_len = rows.len() * width * elem;
        let data_type = desc.info.data_type;

        self.with_bytes(block_start, block_len, |bytes| {
            let mut values = Vec::with_capacity(rows.len() * cols.len());
            for row in bytes.chunks_exact(width * elem) {
                let row_values: Vec<f32> =
                    decode_values(&row[cols.start * elem..cols.end * elem], data_type);
                values.extend(row_values);
            }
            Array2::from_shape_vec((rows.len(), cols.len()), values)
                .map_err(|e| CubeError::corrupt(&self.path, e.to_string()))
        })
    }

    fn read_table(&self, ext: usize) -> Result<Array2<f64>> {
        let desc = self.descriptor(ext)?;
        let shape = &desc.info.shape;
        if shape.len() != 2 {
            return Err(CubeError::corrupt(
                &self.path,
                format!("extension {} is not a two-dimensional table", ext),
            ));
        }
        let (rows, cols) = (shape[0], shape[1]);
        let raw_len = desc.info.byte_len().ok_or_else(|| {
            CubeError::corrupt(&self.path, format!("table extension {} is too large", ext))
        })?;
        let data_type = desc.info.data_type;

        let bytes = self.with_bytes(desc.offset, desc.length as usize, |stored| {
            get_compressor(desc.compression).decompress(stored, raw_len)
        })?;
        if bytes.len() != raw_len {
            return Err(CubeError::corrupt(
                &self.path,
                format!("table extension {} decodes to {} bytes, expected {}", ext, bytes.len(), raw_len),
            ));
        }
        let values: Vec<f64> = decode_values(&bytes, data_type);
        Array2::from_shape_vec((rows, cols), values)
            .map_err(|e| CubeError::corrupt(&self.path, e.to_string()))
    }

    fn release(&self) {
        match &self.backing {
            Backing::Mapped(mmap) => {
                mmap.write().take();
            }
            Backing::Streamed(file) => {
                file.lock().take();
            }
        }
    }
}

/// Builds container files
pub struct ContainerWriter {
    extensions: Vec<(ExtensionInfo, CompressionMethod, Vec<u8>)>,
}

impl ContainerWriter {
    /// Start a container with its primary header as extension 0
    pub fn new(primary: Header) -> Self {
        Self {
            extensions: vec![(
                ExtensionInfo {
                    shape: Vec::new(),
                    header: primary,
                    data_type: DataType::U8,
                },
                CompressionMethod::None,
                Vec::new(),
            )],
        }
    }

    /// Append a `(steps, height, width)` image stack, returns its extension index
    pub fn add_image_stack(&mut self, header: Header, stack: &Array3<f32>) -> usize {
        let bytes = stack.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.extensions.push((
            ExtensionInfo {
                shape: stack.shape().to_vec(),
                header,
                data_type: DataType::F32,
            },
            CompressionMethod::None,
            bytes,
        ));
        self.extensions.len() - 1
    }

    /// Append a record table, returns its extension index
    pub fn add_table(
        &mut self,
        header: Header,
        table: &Array2<f64>,
        compression: CompressionMethod,
    ) -> Result<usize> {
        let raw: Vec<u8> = table.iter().flat_map(|v| v.to_le_bytes()).collect();
        let stored = get_compressor(compression).compress(&raw)?;
        self.extensions.push((
            ExtensionInfo {
                shape: table.shape().to_vec(),
                header,
                data_type: DataType::F64,
            },
            compression,
            stored,
        ));
        Ok(self.extensions.len() - 1)
    }

    /// Append a header-only extension
    pub fn add_header(&mut self, header: Header) -> usize {
        self.extensions.push((
            ExtensionInfo {
                shape: Vec::new(),
                header,
                data_type: DataType::U8,
            },
            CompressionMethod::None,
            Vec::new(),
        ));
        self.extensions.len() - 1
    }

    /// Write the container to `path`
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut offset = 0u64;
        let mut descriptors = Vec::with_capacity(self.extensions.len());
        for (info, compression, bytes) in &self.extensions {
            descriptors.push(ExtensionDescriptor {
                info: info.clone(),
                offset,
                length: bytes.len() as u64,
                compression: *compression,
            });
            offset += bytes.len() as u64;
        }
        let layout = serde_json::to_vec(&ContainerLayout {
            extensions: descriptors,
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        file.write_all(CONTAINER_MAGIC)?;
        file.write_all(&CONTAINER_VERSION.to_le_bytes())?;
        file.write_all(&(layout.len() as u64).to_le_bytes())?;
        file.write_all(&layout)?;
        for (_, _, bytes) in &self.extensions {
            file.write_all(bytes)?;
        }
        file.flush()?;
        Ok(())
    }
}
