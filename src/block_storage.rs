// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Raw fixed-size block storage in a single file.
//!
//! The file layout is
//!
//! ```text
//! magic (8) | block_size (u64 LE) | block_count (u64 LE) | header_len (u64 LE) | locked (u8)
//! header_data (header_len bytes)
//! block 0 | block 1 | ... | block (block_count - 1)
//! ```
//!
//! The `locked` byte is set while a handle holds the storage open, and an advisory
//! exclusive file lock is held alongside it. Both are skipped when opening with `ignore_lock`.

use crate::{BlockSize, OramError};
use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const STORAGE_MAGIC: [u8; 8] = *b"ORAMBLK1";
const INDEX_LEN: usize = 8 + 8 + 8 + 8 + 1;
const LOCKED_OFFSET: u64 = 32;

/// Selects the raw storage implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StorageType {
    /// Blocks are read and written with positioned file I/O.
    #[default]
    File,
    /// The block region of the file is memory-mapped.
    Mmap,
}

impl FromStr for StorageType {
    type Err = OramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(StorageType::File),
            "mmap" => Ok(StorageType::Mmap),
            _ => Err(OramError::InvalidConfigurationError(format!(
                "unknown storage type {s:?}"
            ))),
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::File => write!(f, "file"),
            StorageType::Mmap => write!(f, "mmap"),
        }
    }
}

/// Returns the exact size in bytes of a storage file, or of its block region alone if `ignore_header` is set.
pub fn compute_storage_size(
    block_size: BlockSize,
    block_count: u64,
    header_len: usize,
    ignore_header: bool,
) -> Result<u64, OramError> {
    let too_large = || OramError::InvalidConfigurationError("storage is too large".into());
    let blocks_len = u64::try_from(block_size)?
        .checked_mul(block_count)
        .ok_or_else(too_large)?;
    if ignore_header {
        return Ok(blocks_len);
    }
    u64::try_from(INDEX_LEN + header_len)?
        .checked_add(blocks_len)
        .ok_or_else(too_large)
}

/// A storage of `block_count` blocks of `block_size` bytes plus a fixed-length header.
pub trait BlockStorage {
    /// The file backing this storage.
    fn path(&self) -> &Path;
    /// The size of each block in bytes.
    fn block_size(&self) -> BlockSize;
    /// The number of blocks.
    fn block_count(&self) -> u64;
    /// The caller-owned header bytes.
    fn header_data(&self) -> &[u8];
    /// Replaces the header bytes. The new header must have the same length as the old one.
    fn update_header_data(&mut self, new_header_data: &[u8]) -> Result<(), OramError>;
    /// Reads block `index`.
    fn read_block(&mut self, index: u64) -> Result<Vec<u8>, OramError>;
    /// Overwrites block `index`.
    fn write_block(&mut self, index: u64, data: &[u8]) -> Result<(), OramError>;
    /// Total bytes written to the storage by this handle.
    fn bytes_sent(&self) -> u64;
    /// Total bytes read from the storage by this handle.
    fn bytes_received(&self) -> u64;
    /// Flushes all writes and releases the lock.
    fn close(&mut self) -> Result<(), OramError>;

    /// Reads the blocks at `indices`, in order.
    fn read_blocks(&mut self, indices: &[u64]) -> Result<Vec<Vec<u8>>, OramError> {
        indices.iter().map(|&index| self.read_block(index)).collect()
    }

    /// Writes `blocks[i]` to `indices[i]` for every `i`.
    fn write_blocks(&mut self, indices: &[u64], blocks: &[Vec<u8>]) -> Result<(), OramError> {
        if indices.len() != blocks.len() {
            return Err(OramError::InvalidArgumentError(format!(
                "{} indices but {} blocks",
                indices.len(),
                blocks.len()
            )));
        }
        for (&index, block) in indices.iter().zip(blocks) {
            self.write_block(index, block)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct StorageIndex {
    block_size: u64,
    block_count: u64,
    header_len: u64,
    locked: bool,
}

impl StorageIndex {
    fn encode(&self) -> [u8; INDEX_LEN] {
        let mut result = [0u8; INDEX_LEN];
        result[0..8].copy_from_slice(&STORAGE_MAGIC);
        result[8..16].copy_from_slice(&self.block_size.to_le_bytes());
        result[16..24].copy_from_slice(&self.block_count.to_le_bytes());
        result[24..32].copy_from_slice(&self.header_len.to_le_bytes());
        result[32] = u8::from(self.locked);
        result
    }

    fn decode(bytes: &[u8; INDEX_LEN]) -> Result<Self, OramError> {
        if bytes[0..8] != STORAGE_MAGIC {
            return Err(OramError::FormatError("not a block storage file".into()));
        }
        let field = |range: std::ops::Range<usize>| {
            let mut buffer = [0u8; 8];
            buffer.copy_from_slice(&bytes[range]);
            u64::from_le_bytes(buffer)
        };
        let locked = match bytes[32] {
            0 => false,
            1 => true,
            other => {
                return Err(OramError::FormatError(format!(
                    "invalid lock flag {other}"
                )))
            }
        };
        Ok(Self {
            block_size: field(8..16),
            block_count: field(16..24),
            header_len: field(24..32),
            locked,
        })
    }

    fn data_offset(&self) -> u64 {
        INDEX_LEN as u64 + self.header_len
    }
}

/// The file, index and header shared by both storage implementations.
#[derive(Debug)]
struct StorageFile {
    path: PathBuf,
    file: File,
    index: StorageIndex,
    block_size: BlockSize,
    header_data: Vec<u8>,
    holds_lock: bool,
    closed: bool,
}

impl StorageFile {
    fn create(
        path: &Path,
        block_size: BlockSize,
        block_count: u64,
        header_data: &[u8],
        ignore_existing: bool,
    ) -> Result<Self, OramError> {
        if block_size < 1 || block_count < 1 {
            return Err(OramError::InvalidConfigurationError(
                "block size and block count must be at least 1".into(),
            ));
        }
        let total_len = compute_storage_size(block_size, block_count, header_data.len(), false)?;
        if path.exists() && !ignore_existing {
            return Err(OramError::AlreadyExistsError(path.to_path_buf()));
        }

        // Lock before truncating, so an existing store held open elsewhere is left intact.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        try_lock(&file, path)?;
        file.set_len(0)?;

        let index = StorageIndex {
            block_size: u64::try_from(block_size)?,
            block_count,
            header_len: u64::try_from(header_data.len())?,
            locked: true,
        };
        file.write_all(&index.encode())?;
        file.write_all(header_data)?;
        file.set_len(total_len)?;

        log::debug!(
            "Created block storage {} ({} blocks of {} bytes)",
            path.display(),
            block_count,
            block_size
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            index,
            block_size,
            header_data: header_data.to_vec(),
            holds_lock: true,
            closed: false,
        })
    }

    fn open(path: &Path, ignore_lock: bool) -> Result<Self, OramError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut index_bytes = [0u8; INDEX_LEN];
        file.read_exact(&mut index_bytes).map_err(truncated)?;
        let mut index = StorageIndex::decode(&index_bytes)?;
        let block_size = BlockSize::try_from(index.block_size)?;
        if block_size < 1 || index.block_count < 1 {
            return Err(OramError::FormatError("empty block geometry".into()));
        }

        let expected_len = compute_storage_size(
            block_size,
            index.block_count,
            usize::try_from(index.header_len)?,
            false,
        )?;
        let actual_len = file.metadata()?.len();
        if actual_len != expected_len {
            return Err(OramError::FormatError(format!(
                "expected a file of {expected_len} bytes, found {actual_len}"
            )));
        }

        let mut header_data = vec![0u8; usize::try_from(index.header_len)?];
        file.read_exact(&mut header_data).map_err(truncated)?;

        if !ignore_lock {
            try_lock(&file, path)?;
            if index.locked {
                FileExt::unlock(&file)?;
                return Err(OramError::StorageLockedError(path.to_path_buf()));
            }
            index.locked = true;
            write_lock_flag(&mut file, true)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            index,
            block_size,
            header_data,
            holds_lock: !ignore_lock,
            closed: false,
        })
    }

    fn block_offset(&self, index: u64) -> Result<u64, OramError> {
        if index >= self.index.block_count {
            return Err(OramError::InvalidArgumentError(format!(
                "block index {index} is out of range for {} blocks",
                self.index.block_count
            )));
        }
        Ok(self.index.data_offset() + index * self.index.block_size)
    }

    fn check_block_len(&self, data: &[u8]) -> Result<(), OramError> {
        if data.len() != self.block_size {
            return Err(OramError::InvalidArgumentError(format!(
                "expected a block of {} bytes, got {}",
                self.block_size,
                data.len()
            )));
        }
        Ok(())
    }

    fn update_header_data(&mut self, new_header_data: &[u8]) -> Result<(), OramError> {
        if new_header_data.len() != self.header_data.len() {
            return Err(OramError::InvalidArgumentError(format!(
                "header must be {} bytes, got {}",
                self.header_data.len(),
                new_header_data.len()
            )));
        }
        self.file.seek(SeekFrom::Start(INDEX_LEN as u64))?;
        self.file.write_all(new_header_data)?;
        self.file.sync_data()?;
        self.header_data = new_header_data.to_vec();
        Ok(())
    }

    fn release(&mut self) -> Result<(), OramError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.holds_lock {
            write_lock_flag(&mut self.file, false)?;
            self.index.locked = false;
        }
        self.file.sync_all()?;
        if self.holds_lock {
            FileExt::unlock(&self.file)?;
        }
        log::debug!("Closed block storage {}", self.path.display());
        Ok(())
    }
}

impl Drop for StorageFile {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!(
                "Failed to release block storage {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

fn try_lock(file: &File, path: &Path) -> Result<(), OramError> {
    FileExt::try_lock_exclusive(file).map_err(|e| {
        if e.kind() == ErrorKind::WouldBlock
            || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
        {
            OramError::StorageLockedError(path.to_path_buf())
        } else {
            OramError::IoError(e)
        }
    })
}

fn write_lock_flag(file: &mut File, locked: bool) -> Result<(), OramError> {
    file.seek(SeekFrom::Start(LOCKED_OFFSET))?;
    file.write_all(&[u8::from(locked)])?;
    file.sync_data()?;
    Ok(())
}

fn truncated(e: std::io::Error) -> OramError {
    if e.kind() == ErrorKind::UnexpectedEof {
        OramError::FormatError("storage file is truncated".into())
    } else {
        OramError::IoError(e)
    }
}

/// Block storage using positioned reads and writes on a file.
#[derive(Debug)]
pub struct FileBlockStorage {
    inner: StorageFile,
    bytes_sent: u64,
    bytes_received: u64,
}

impl FileBlockStorage {
    /// Creates a new storage file of `block_count` zeroed blocks, and holds it locked.
    ///
    /// # Errors
    ///
    /// Returns an `AlreadyExistsError` if `path` exists and `ignore_existing` is false.
    pub fn setup(
        path: &Path,
        block_size: BlockSize,
        block_count: u64,
        header_data: &[u8],
        ignore_existing: bool,
    ) -> Result<Self, OramError> {
        let inner = StorageFile::create(
            path,
            block_size,
            block_count,
            header_data,
            ignore_existing,
        )?;
        Ok(Self {
            inner,
            bytes_sent: 0,
            bytes_received: 0,
        })
    }

    /// Opens an existing storage file.
    ///
    /// # Errors
    ///
    /// Returns a `StorageLockedError` if another handle holds the storage and `ignore_lock` is false.
    pub fn open(path: &Path, ignore_lock: bool) -> Result<Self, OramError> {
        Ok(Self {
            inner: StorageFile::open(path, ignore_lock)?,
            bytes_sent: 0,
            bytes_received: 0,
        })
    }
}

impl BlockStorage for FileBlockStorage {
    fn path(&self) -> &Path {
        &self.inner.path
    }

    fn block_size(&self) -> BlockSize {
        self.inner.block_size
    }

    fn block_count(&self) -> u64 {
        self.inner.index.block_count
    }

    fn header_data(&self) -> &[u8] {
        &self.inner.header_data
    }

    fn update_header_data(&mut self, new_header_data: &[u8]) -> Result<(), OramError> {
        self.inner.update_header_data(new_header_data)?;
        self.bytes_sent += u64::try_from(new_header_data.len())?;
        Ok(())
    }

    fn read_block(&mut self, index: u64) -> Result<Vec<u8>, OramError> {
        let offset = self.inner.block_offset(index)?;
        let mut result = vec![0u8; self.inner.block_size];
        self.inner.file.seek(SeekFrom::Start(offset))?;
        self.inner.file.read_exact(&mut result).map_err(truncated)?;
        self.bytes_received += self.inner.index.block_size;
        Ok(result)
    }

    fn write_block(&mut self, index: u64, data: &[u8]) -> Result<(), OramError> {
        self.inner.check_block_len(data)?;
        let offset = self.inner.block_offset(index)?;
        self.inner.file.seek(SeekFrom::Start(offset))?;
        self.inner.file.write_all(data)?;
        self.bytes_sent += self.inner.index.block_size;
        Ok(())
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    fn close(&mut self) -> Result<(), OramError> {
        self.inner.release()
    }
}

/// Block storage with the block region of the file memory-mapped.
#[derive(Debug)]
pub struct MmapBlockStorage {
    // Declared before `inner` so the mapping is dropped before the file is released.
    mmap: MmapMut,
    inner: StorageFile,
    bytes_sent: u64,
    bytes_received: u64,
}

impl MmapBlockStorage {
    /// Creates a new storage file of `block_count` zeroed blocks, and holds it locked.
    ///
    /// # Errors
    ///
    /// Returns an `AlreadyExistsError` if `path` exists and `ignore_existing` is false.
    pub fn setup(
        path: &Path,
        block_size: BlockSize,
        block_count: u64,
        header_data: &[u8],
        ignore_existing: bool,
    ) -> Result<Self, OramError> {
        let inner = StorageFile::create(
            path,
            block_size,
            block_count,
            header_data,
            ignore_existing,
        )?;
        Self::map(inner)
    }

    /// Opens an existing storage file.
    ///
    /// # Errors
    ///
    /// Returns a `StorageLockedError` if another handle holds the storage and `ignore_lock` is false.
    pub fn open(path: &Path, ignore_lock: bool) -> Result<Self, OramError> {
        Self::map(StorageFile::open(path, ignore_lock)?)
    }

    fn map(inner: StorageFile) -> Result<Self, OramError> {
        let len = usize::try_from(compute_storage_size(
            inner.block_size,
            inner.index.block_count,
            0,
            true,
        )?)?;
        // SAFETY: the file length was fixed at creation and is never changed afterwards.
        // Other processes are kept out by the lock unless the caller opts out with `ignore_lock`.
        let mmap = unsafe {
            MmapOptions::new()
                .offset(inner.index.data_offset())
                .len(len)
                .map_mut(&inner.file)?
        };
        Ok(Self {
            mmap,
            inner,
            bytes_sent: 0,
            bytes_received: 0,
        })
    }

    fn block_range(&self, index: u64) -> Result<std::ops::Range<usize>, OramError> {
        let start =
            usize::try_from(self.inner.block_offset(index)? - self.inner.index.data_offset())?;
        Ok(start..start + self.inner.block_size)
    }
}

impl BlockStorage for MmapBlockStorage {
    fn path(&self) -> &Path {
        &self.inner.path
    }

    fn block_size(&self) -> BlockSize {
        self.inner.block_size
    }

    fn block_count(&self) -> u64 {
        self.inner.index.block_count
    }

    fn header_data(&self) -> &[u8] {
        &self.inner.header_data
    }

    fn update_header_data(&mut self, new_header_data: &[u8]) -> Result<(), OramError> {
        self.inner.update_header_data(new_header_data)?;
        self.bytes_sent += u64::try_from(new_header_data.len())?;
        Ok(())
    }

    fn read_block(&mut self, index: u64) -> Result<Vec<u8>, OramError> {
        let range = self.block_range(index)?;
        self.bytes_received += self.inner.index.block_size;
        Ok(self.mmap[range].to_vec())
    }

    fn write_block(&mut self, index: u64, data: &[u8]) -> Result<(), OramError> {
        self.inner.check_block_len(data)?;
        let range = self.block_range(index)?;
        self.mmap[range].copy_from_slice(data);
        self.bytes_sent += self.inner.index.block_size;
        Ok(())
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    fn close(&mut self) -> Result<(), OramError> {
        if !self.inner.closed {
            self.mmap.flush()?;
        }
        self.inner.release()
    }
}

/// A block storage of either type, selected at setup or open time.
#[derive(Debug)]
pub enum StorageBackend {
    /// See [`FileBlockStorage`].
    File(FileBlockStorage),
    /// See [`MmapBlockStorage`].
    Mmap(MmapBlockStorage),
}

impl StorageBackend {
    /// Creates a new storage of the given type. See [`FileBlockStorage::setup`].
    pub fn setup(
        storage_type: StorageType,
        path: &Path,
        block_size: BlockSize,
        block_count: u64,
        header_data: &[u8],
        ignore_existing: bool,
    ) -> Result<Self, OramError> {
        Ok(match storage_type {
            StorageType::File => StorageBackend::File(FileBlockStorage::setup(
                path,
                block_size,
                block_count,
                header_data,
                ignore_existing,
            )?),
            StorageType::Mmap => StorageBackend::Mmap(MmapBlockStorage::setup(
                path,
                block_size,
                block_count,
                header_data,
                ignore_existing,
            )?),
        })
    }

    /// Opens an existing storage as the given type. See [`FileBlockStorage::open`].
    pub fn open(
        storage_type: StorageType,
        path: &Path,
        ignore_lock: bool,
    ) -> Result<Self, OramError> {
        Ok(match storage_type {
            StorageType::File => StorageBackend::File(FileBlockStorage::open(path, ignore_lock)?),
            StorageType::Mmap => StorageBackend::Mmap(MmapBlockStorage::open(path, ignore_lock)?),
        })
    }

    /// The type of this storage.
    pub fn storage_type(&self) -> StorageType {
        match self {
            StorageBackend::File(_) => StorageType::File,
            StorageBackend::Mmap(_) => StorageType::Mmap,
        }
    }

    fn as_dyn(&self) -> &dyn BlockStorage {
        match self {
            StorageBackend::File(storage) => storage,
            StorageBackend::Mmap(storage) => storage,
        }
    }

    fn as_dyn_mut(&mut self) -> &mut dyn BlockStorage {
        match self {
            StorageBackend::File(storage) => storage,
            StorageBackend::Mmap(storage) => storage,
        }
    }
}

impl BlockStorage for StorageBackend {
    fn path(&self) -> &Path {
        self.as_dyn().path()
    }

    fn block_size(&self) -> BlockSize {
        self.as_dyn().block_size()
    }

    fn block_count(&self) -> u64 {
        self.as_dyn().block_count()
    }

    fn header_data(&self) -> &[u8] {
        self.as_dyn().header_data()
    }

    fn update_header_data(&mut self, new_header_data: &[u8]) -> Result<(), OramError> {
        self.as_dyn_mut().update_header_data(new_header_data)
    }

    fn read_block(&mut self, index: u64) -> Result<Vec<u8>, OramError> {
        self.as_dyn_mut().read_block(index)
    }

    fn write_block(&mut self, index: u64, data: &[u8]) -> Result<(), OramError> {
        self.as_dyn_mut().write_block(index, data)
    }

    fn bytes_sent(&self) -> u64 {
        self.as_dyn().bytes_sent()
    }

    fn bytes_received(&self) -> u64 {
        self.as_dyn().bytes_received()
    }

    fn close(&mut self) -> Result<(), OramError> {
        self.as_dyn_mut().close()
    }
}
