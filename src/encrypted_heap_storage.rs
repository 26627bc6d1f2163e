// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A tree of encrypted buckets stored in heap order on a [`BlockStorage`].
//!
//! The raw storage header holds the cipher mode in the clear, followed by an encryption of
//!
//! ```text
//! magic (8) | heap_base | height | bucket_capacity | block_size | header_len (u64 LE each) | header_data
//! ```
//!
//! Each bucket is stored as one raw block, encrypted under a fresh IV on every write.

use crate::block_storage::{self, BlockStorage, StorageBackend, StorageType};
use crate::bucket::{Bucket, BucketCodec};
use crate::cipher::{BucketCipher, CipherMode};
use crate::virtual_heap::VirtualHeap;
use crate::{BlockSize, BucketIndex, BucketSize, HeapBase, OramError, TreeHeight};
use std::path::Path;

const HEAP_MAGIC: [u8; 8] = *b"ORAMHEAP";
const HEAP_FIELDS_LEN: usize = HEAP_MAGIC.len() + 5 * 8;
const HEADER_ASSOCIATED_DATA: &[u8] = b"heap header";

/// The persisted description of an encrypted heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapStorageHeader {
    /// The branching factor of the tree.
    pub heap_base: HeapBase,
    /// The height of the tree. A tree of height `h` has `h + 1` levels.
    pub height: TreeHeight,
    /// The number of block slots per bucket.
    pub bucket_capacity: BucketSize,
    /// The payload size of each block.
    pub block_size: BlockSize,
    /// The cipher mode buckets are encrypted with.
    pub cipher_mode: CipherMode,
    /// Caller-owned bytes stored alongside the geometry. Their length is fixed at creation.
    pub header_data: Vec<u8>,
}

impl HeapStorageHeader {
    fn encode_fields(&self) -> Result<Vec<u8>, OramError> {
        let mut result = Vec::with_capacity(HEAP_FIELDS_LEN + self.header_data.len());
        result.extend_from_slice(&HEAP_MAGIC);
        result.extend_from_slice(&self.heap_base.to_le_bytes());
        result.extend_from_slice(&self.height.to_le_bytes());
        result.extend_from_slice(&u64::try_from(self.bucket_capacity)?.to_le_bytes());
        result.extend_from_slice(&u64::try_from(self.block_size)?.to_le_bytes());
        result.extend_from_slice(&u64::try_from(self.header_data.len())?.to_le_bytes());
        result.extend_from_slice(&self.header_data);
        Ok(result)
    }

    /// Parses decrypted header fields. A missing magic means the header was decrypted under the wrong key.
    fn decode_fields(cipher_mode: CipherMode, bytes: &[u8]) -> Result<Self, OramError> {
        if bytes.len() < HEAP_FIELDS_LEN || bytes[..HEAP_MAGIC.len()] != HEAP_MAGIC {
            return Err(OramError::BadKeyError);
        }
        let field = |i: usize| {
            let start = HEAP_MAGIC.len() + 8 * i;
            let mut buffer = [0u8; 8];
            buffer.copy_from_slice(&bytes[start..start + 8]);
            u64::from_le_bytes(buffer)
        };
        let header_data = &bytes[HEAP_FIELDS_LEN..];
        if field(4) != u64::try_from(header_data.len())? {
            return Err(OramError::FormatError(format!(
                "header declares {} caller bytes but holds {}",
                field(4),
                header_data.len()
            )));
        }
        Ok(Self {
            heap_base: field(0),
            height: field(1),
            bucket_capacity: BucketSize::try_from(field(2))?,
            block_size: BlockSize::try_from(field(3))?,
            cipher_mode,
            header_data: header_data.to_vec(),
        })
    }

    fn raw_header_len(&self) -> usize {
        1 + self
            .cipher_mode
            .ciphertext_len(HEAP_FIELDS_LEN + self.header_data.len())
    }
}

/// Encrypted bucket storage for a Path ORAM tree.
#[derive(Debug)]
pub struct EncryptedHeapStorage {
    storage: StorageBackend,
    cipher: BucketCipher,
    heap: VirtualHeap,
    codec: BucketCodec,
    header: HeapStorageHeader,
    bucket_reads: u64,
    bucket_writes: u64,
}

impl EncryptedHeapStorage {
    /// Creates a storage file at `path` holding the tree described by `header`, with every bucket empty.
    ///
    /// # Errors
    ///
    /// Returns an `AlreadyExistsError` if `path` exists and `ignore_existing` is false,
    /// and an `InvalidConfigurationError` if the geometry or key is unusable.
    pub fn create(
        path: &Path,
        storage_type: StorageType,
        header: HeapStorageHeader,
        key: &[u8],
        ignore_existing: bool,
    ) -> Result<Self, OramError> {
        let heap = VirtualHeap::new(header.heap_base, header.height, header.bucket_capacity)?;
        let codec = BucketCodec::new(header.block_size, header.bucket_capacity)?;
        let cipher = BucketCipher::new(header.cipher_mode, key)?;
        let raw_header = encrypt_header(&cipher, &header)?;

        let storage = StorageBackend::setup(
            storage_type,
            path,
            header.cipher_mode.ciphertext_len(codec.encoded_len()),
            heap.bucket_count(),
            &raw_header,
            ignore_existing,
        )?;

        let mut result = Self {
            storage,
            cipher,
            heap,
            codec,
            header,
            bucket_reads: 0,
            bucket_writes: 0,
        };
        let empty = result.codec.empty_bucket();
        for index in 0..result.heap.bucket_count() {
            result.write_bucket(index, &empty)?;
        }
        result.bucket_writes = 0;

        log::info!(
            "EncryptedHeapStorage::create(path = {}, buckets = {}, cipher = {})",
            path.display(),
            result.heap.bucket_count(),
            result.header.cipher_mode
        );
        Ok(result)
    }

    /// Opens an existing encrypted heap.
    ///
    /// # Errors
    ///
    /// Returns a `BadKeyError` if `key` does not decrypt the header, a `FormatError` if the
    /// header is inconsistent with the file, and a `StorageLockedError` if the storage is held
    /// by another handle and `ignore_lock` is false.
    pub fn open(
        path: &Path,
        storage_type: StorageType,
        key: &[u8],
        ignore_lock: bool,
    ) -> Result<Self, OramError> {
        let storage = StorageBackend::open(storage_type, path, ignore_lock)?;
        let raw_header = storage.header_data();
        let (&mode_byte, encrypted) = raw_header
            .split_first()
            .ok_or_else(|| OramError::FormatError("missing heap header".into()))?;
        let cipher_mode = CipherMode::from_byte(mode_byte)?;
        let cipher = BucketCipher::new(cipher_mode, key).map_err(|_| OramError::BadKeyError)?;
        let fields = cipher
            .decrypt(encrypted, HEADER_ASSOCIATED_DATA)
            .map_err(|_| OramError::BadKeyError)?;
        let header = HeapStorageHeader::decode_fields(cipher_mode, &fields)?;

        let heap = VirtualHeap::new(header.heap_base, header.height, header.bucket_capacity)
            .map_err(|e| OramError::FormatError(e.to_string()))?;
        let codec = BucketCodec::new(header.block_size, header.bucket_capacity)
            .map_err(|e| OramError::FormatError(e.to_string()))?;
        if storage.block_count() != heap.bucket_count() {
            return Err(OramError::FormatError(format!(
                "storage holds {} buckets but the tree has {}",
                storage.block_count(),
                heap.bucket_count()
            )));
        }
        if storage.block_size() != cipher_mode.ciphertext_len(codec.encoded_len()) {
            return Err(OramError::FormatError(format!(
                "stored buckets are {} bytes but the geometry needs {}",
                storage.block_size(),
                cipher_mode.ciphertext_len(codec.encoded_len())
            )));
        }

        log::info!(
            "EncryptedHeapStorage::open(path = {}, buckets = {}, cipher = {})",
            path.display(),
            heap.bucket_count(),
            cipher_mode
        );
        Ok(Self {
            storage,
            cipher,
            heap,
            codec,
            header,
            bucket_reads: 0,
            bucket_writes: 0,
        })
    }

    /// The exact size in bytes of the storage file for `header`, or of its bucket region alone if `ignore_header` is set.
    pub fn compute_storage_size(
        header: &HeapStorageHeader,
        ignore_header: bool,
    ) -> Result<u64, OramError> {
        let heap = VirtualHeap::new(header.heap_base, header.height, header.bucket_capacity)?;
        let codec = BucketCodec::new(header.block_size, header.bucket_capacity)?;
        block_storage::compute_storage_size(
            header.cipher_mode.ciphertext_len(codec.encoded_len()),
            heap.bucket_count(),
            header.raw_header_len(),
            ignore_header,
        )
    }

    /// Reads and decrypts bucket `index`.
    ///
    /// # Errors
    ///
    /// Returns a `CorruptBucketError` if the bucket fails authentication or does not decode.
    pub fn read_bucket(&mut self, index: BucketIndex) -> Result<Bucket, OramError> {
        self.check_index(index)?;
        let ciphertext = self.storage.read_block(index)?;
        let plaintext = self
            .cipher
            .decrypt(&ciphertext, &index.to_le_bytes())
            .map_err(|_| {
                OramError::CorruptBucketError(format!("bucket {index} failed authentication"))
            })?;
        self.bucket_reads += 1;
        log::debug!("Physical read -- bucket {}", index);
        self.codec.decode(&plaintext)
    }

    /// Encrypts `bucket` under a fresh IV and writes it to `index`.
    pub fn write_bucket(&mut self, index: BucketIndex, bucket: &Bucket) -> Result<(), OramError> {
        self.check_index(index)?;
        let plaintext = self.codec.encode(bucket)?;
        let ciphertext = self.cipher.encrypt(&plaintext, &index.to_le_bytes())?;
        self.storage.write_block(index, &ciphertext)?;
        self.bucket_writes += 1;
        log::debug!("Physical write -- bucket {}", index);
        Ok(())
    }

    /// Reads the buckets at `indices`, in order.
    pub fn read_buckets(&mut self, indices: &[BucketIndex]) -> Result<Vec<Bucket>, OramError> {
        indices.iter().map(|&index| self.read_bucket(index)).collect()
    }

    /// Writes `buckets[i]` to `indices[i]` for every `i`.
    pub fn write_buckets(
        &mut self,
        indices: &[BucketIndex],
        buckets: &[Bucket],
    ) -> Result<(), OramError> {
        if indices.len() != buckets.len() {
            return Err(OramError::InvalidArgumentError(format!(
                "{} indices but {} buckets",
                indices.len(),
                buckets.len()
            )));
        }
        for (&index, bucket) in indices.iter().zip(buckets) {
            self.write_bucket(index, bucket)?;
        }
        Ok(())
    }

    /// Replaces the caller-owned header bytes without touching the tree.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidArgumentError`, leaving the header unchanged, if the length differs from the current header.
    pub fn update_header_data(&mut self, new_header_data: &[u8]) -> Result<(), OramError> {
        if new_header_data.len() != self.header.header_data.len() {
            return Err(OramError::InvalidArgumentError(format!(
                "header data must be {} bytes, got {}",
                self.header.header_data.len(),
                new_header_data.len()
            )));
        }
        let mut header = self.header.clone();
        header.header_data = new_header_data.to_vec();
        let raw_header = encrypt_header(&self.cipher, &header)?;
        self.storage.update_header_data(&raw_header)?;
        self.header = header;
        Ok(())
    }

    /// The persisted header.
    pub fn header(&self) -> &HeapStorageHeader {
        &self.header
    }

    /// The caller-owned header bytes.
    pub fn header_data(&self) -> &[u8] {
        &self.header.header_data
    }

    /// The tree geometry.
    pub fn heap(&self) -> &VirtualHeap {
        &self.heap
    }

    /// The bucket encoding.
    pub fn codec(&self) -> &BucketCodec {
        &self.codec
    }

    /// The cipher mode.
    pub fn cipher_mode(&self) -> CipherMode {
        self.cipher.mode()
    }

    /// The encryption key.
    pub fn key(&self) -> &[u8] {
        self.cipher.key()
    }

    /// The raw storage type.
    pub fn storage_type(&self) -> StorageType {
        self.storage.storage_type()
    }

    /// The number of buckets decrypted since this handle was created.
    pub fn bucket_reads(&self) -> u64 {
        self.bucket_reads
    }

    /// The number of buckets written since this handle was created. Initialisation at creation is not counted.
    pub fn bucket_writes(&self) -> u64 {
        self.bucket_writes
    }

    /// Raw bytes written to the backend.
    pub fn bytes_sent(&self) -> u64 {
        self.storage.bytes_sent()
    }

    /// Raw bytes read from the backend.
    pub fn bytes_received(&self) -> u64 {
        self.storage.bytes_received()
    }

    /// Flushes the storage and releases its lock.
    pub fn close(&mut self) -> Result<(), OramError> {
        self.storage.close()
    }

    fn check_index(&self, index: BucketIndex) -> Result<(), OramError> {
        if index >= self.heap.bucket_count() {
            return Err(OramError::InvalidArgumentError(format!(
                "bucket {index} is out of range for a tree of {} buckets",
                self.heap.bucket_count()
            )));
        }
        Ok(())
    }
}

fn encrypt_header(cipher: &BucketCipher, header: &HeapStorageHeader) -> Result<Vec<u8>, OramError> {
    let mut result = vec![header.cipher_mode.to_byte()];
    result.extend(cipher.encrypt(&header.encode_fields()?, HEADER_ASSOCIATED_DATA)?);
    Ok(result)
}
