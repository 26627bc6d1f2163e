// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A file-backed Path ORAM.

use crate::{
    block_storage::StorageType,
    bucket::{Block, Bucket},
    cipher::{generate_key, CipherMode, DEFAULT_KEY_SIZE},
    encrypted_heap_storage::{EncryptedHeapStorage, HeapStorageHeader},
    integrity::{IntegrityHeader, OramState},
    path::LoadedPath,
    position_map::PositionMap,
    stash::Stash,
    virtual_heap::VirtualHeap,
    BlockId, BlockSize, BucketIndex, BucketSize, HeapBase, OramError, TreeHeight,
};
use rand::{rngs::StdRng, SeedableRng};
use std::collections::BTreeMap;
use std::path::Path;

/// The parameter "Z" from the Path ORAM literature that sets the number of blocks per bucket; typical values are 3 or 4.
/// Here we adopt the more conservative setting of 4.
pub const DEFAULT_BUCKET_CAPACITY: BucketSize = 4;

/// The default branching factor of the storage tree.
pub const DEFAULT_HEAP_BASE: HeapBase = 2;

/// Parameters for [`PathOram::setup`].
#[derive(Clone, Debug)]
pub struct SetupOptions {
    /// Block slots per bucket ("Z").
    pub bucket_capacity: BucketSize,
    /// Branching factor of the tree ("k").
    pub heap_base: HeapBase,
    /// The encryption key. A random key of `key_size` bytes is generated if `None`.
    pub key: Option<Vec<u8>>,
    /// The size of a generated key: 16, 24 or 32 bytes.
    pub key_size: usize,
    /// Caller-owned header bytes. Later updates must keep this length.
    pub header_data: Vec<u8>,
    /// The raw storage implementation.
    pub storage_type: StorageType,
    /// The bucket cipher.
    pub cipher_mode: CipherMode,
    /// Overwrite any file already at the path.
    pub ignore_existing: bool,
    /// The number of top tree levels to keep in memory.
    pub cached_levels: TreeHeight,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            heap_base: DEFAULT_HEAP_BASE,
            key: None,
            key_size: DEFAULT_KEY_SIZE,
            header_data: Vec::new(),
            storage_type: StorageType::default(),
            cipher_mode: CipherMode::default(),
            ignore_existing: false,
            cached_levels: 0,
        }
    }
}

/// Parameters for [`PathOram::open`].
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// The raw storage implementation.
    pub storage_type: StorageType,
    /// Open even if another handle holds the storage. The caller is then responsible for
    /// ensuring that at most one handle accesses the store.
    pub ignore_lock: bool,
    /// The number of top tree levels to keep in memory.
    pub cached_levels: TreeHeight,
}

/// A Path ORAM over an encrypted tree of buckets in a file.
///
/// ## Security
///
/// Every access reads and rewrites one full root-to-leaf path, and the accessed block is
/// remapped to a fresh uniformly random leaf. An observer of the storage therefore sees a
/// sequence of uniformly random paths regardless of which blocks are accessed.
/// The stash and position map must be kept private by the caller between sessions.
#[derive(Debug)]
pub struct PathOram {
    storage: EncryptedHeapStorage,
    heap: VirtualHeap,
    block_count: u64,
    block_size: BlockSize,
    stash: Stash,
    position_map: PositionMap,
    user_header_data: Vec<u8>,
    /// Buckets `0..cache.len()`, the top `cached_levels` levels of the tree.
    cache: Vec<Bucket>,
    cached_levels: TreeHeight,
    rng: StdRng,
    /// Whether the header holds the in-use record instead of the last close's digests.
    in_use: bool,
    poisoned: bool,
    closed: bool,
}

impl PathOram {
    /// Creates a store of `block_count` zeroed blocks of `block_size` bytes at `path`.
    ///
    /// # Errors
    ///
    /// Returns an `AlreadyExistsError` if `path` exists and `options.ignore_existing` is false,
    /// and an `InvalidConfigurationError` for unusable geometry or key parameters.
    pub fn setup(
        path: impl AsRef<Path>,
        block_size: BlockSize,
        block_count: u64,
        options: SetupOptions,
    ) -> Result<Self, OramError> {
        let path = path.as_ref();
        let heap =
            VirtualHeap::for_block_count(options.heap_base, block_count, options.bucket_capacity)?;
        if block_size < 1 {
            return Err(OramError::InvalidConfigurationError(
                "block size must be at least 1".into(),
            ));
        }
        let key = match options.key {
            Some(key) => key,
            None => generate_key(options.key_size)?,
        };

        log::info!(
            "PathOram::setup(path = {}, block_count = {}, block_size = {}, height = {}, Z = {}, k = {})",
            path.display(),
            block_count,
            block_size,
            heap.height(),
            heap.blocks_per_bucket(),
            heap.heap_base()
        );

        let mut rng = StdRng::from_entropy();
        let position_map = PositionMap::random(block_count, &heap, &mut rng)?;
        let (buckets, stash) = initial_placement(&heap, &position_map, block_size)?;

        let state = OramState::new(stash, position_map);
        let integrity = IntegrityHeader::for_state(&state)?;
        let header = HeapStorageHeader {
            heap_base: heap.heap_base(),
            height: heap.height(),
            bucket_capacity: heap.blocks_per_bucket(),
            block_size,
            cipher_mode: options.cipher_mode,
            header_data: integrity.encode(&options.header_data),
        };
        let mut storage = EncryptedHeapStorage::create(
            path,
            options.storage_type,
            header,
            &key,
            options.ignore_existing,
        )?;
        for (index, bucket) in &buckets {
            storage.write_bucket(*index, bucket)?;
        }

        let OramState {
            stash,
            position_map,
        } = state;
        Self::from_parts(
            storage,
            block_count,
            stash,
            position_map,
            options.header_data,
            options.cached_levels,
            rng,
        )
    }

    /// Opens an existing store with the client state returned by the last [`PathOram::close`].
    ///
    /// # Errors
    ///
    /// - `InvalidArgumentError` if `key` is empty.
    /// - `BadKeyError` if `key` does not decrypt the storage header.
    /// - `StorageLockedError` if another handle holds the store and `options.ignore_lock` is false.
    /// - `InvalidStateError` if `state` has out-of-range entries.
    /// - `DigestMismatchError` if `state` is not the state recorded at the last close, or if the
    ///   last handle to access the store was never closed cleanly.
    pub fn open(
        path: impl AsRef<Path>,
        state: OramState,
        key: &[u8],
        options: OpenOptions,
    ) -> Result<Self, OramError> {
        let path = path.as_ref();
        if key.is_empty() {
            return Err(OramError::InvalidArgumentError(
                "a key is required to open a store".into(),
            ));
        }
        let storage =
            EncryptedHeapStorage::open(path, options.storage_type, key, options.ignore_lock)?;
        let (integrity, user_header_data) = IntegrityHeader::decode(storage.header_data())?;
        let user_header_data = user_header_data.to_vec();
        let block_count = integrity.block_count;

        let heap = *storage.heap();
        let expected_heap =
            VirtualHeap::for_block_count(heap.heap_base(), block_count, heap.blocks_per_bucket())
                .map_err(|e| OramError::FormatError(e.to_string()))?;
        if expected_heap != heap {
            return Err(OramError::FormatError(format!(
                "a tree of height {} does not fit {} blocks",
                heap.height(),
                block_count
            )));
        }

        state.validate(&heap, block_count, storage.codec().block_size())?;
        integrity.verify(&state)?;

        log::info!(
            "PathOram::open(path = {}, block_count = {}, stash size = {})",
            path.display(),
            block_count,
            state.stash.len()
        );

        Self::from_parts(
            storage,
            block_count,
            state.stash,
            state.position_map,
            user_header_data,
            options.cached_levels,
            StdRng::from_entropy(),
        )
    }

    fn from_parts(
        mut storage: EncryptedHeapStorage,
        block_count: u64,
        stash: Stash,
        position_map: PositionMap,
        user_header_data: Vec<u8>,
        cached_levels: TreeHeight,
        rng: StdRng,
    ) -> Result<Self, OramError> {
        let heap = *storage.heap();
        let cached_levels = cached_levels.min(heap.levels());
        let cached_bucket_count = if cached_levels == heap.levels() {
            heap.bucket_count()
        } else {
            heap.first_bucket_at_level(cached_levels)
        };
        let cache = (0..cached_bucket_count)
            .map(|index| storage.read_bucket(index))
            .collect::<Result<Vec<Bucket>, OramError>>()?;

        Ok(Self {
            block_size: storage.codec().block_size(),
            storage,
            heap,
            block_count,
            stash,
            position_map,
            user_header_data,
            cache,
            cached_levels,
            rng,
            in_use: false,
            poisoned: false,
            closed: false,
        })
    }

    /// The exact size in bytes of the file [`PathOram::setup`] creates for these parameters,
    /// or of its bucket region alone if `ignore_header` is set.
    pub fn compute_storage_size(
        block_size: BlockSize,
        block_count: u64,
        options: &SetupOptions,
        ignore_header: bool,
    ) -> Result<u64, OramError> {
        let heap =
            VirtualHeap::for_block_count(options.heap_base, block_count, options.bucket_capacity)?;
        let header = HeapStorageHeader {
            heap_base: heap.heap_base(),
            height: heap.height(),
            bucket_capacity: heap.blocks_per_bucket(),
            block_size,
            cipher_mode: options.cipher_mode,
            header_data: vec![0u8; IntegrityHeader::LEN + options.header_data.len()],
        };
        EncryptedHeapStorage::compute_storage_size(&header, ignore_header)
    }

    /// Returns the contents of block `block_id`.
    pub fn read_block(&mut self, block_id: BlockId) -> Result<Vec<u8>, OramError> {
        self.check_block_id(block_id)?;
        self.access(block_id, None)
    }

    /// Returns the contents of the blocks `block_ids`, in order.
    ///
    /// Each block is accessed in turn with a full Path ORAM access. All identifiers are checked before the first access.
    pub fn read_blocks(&mut self, block_ids: &[BlockId]) -> Result<Vec<Vec<u8>>, OramError> {
        for &block_id in block_ids {
            self.check_block_id(block_id)?;
        }
        block_ids
            .iter()
            .map(|&block_id| self.access(block_id, None))
            .collect()
    }

    /// Overwrites block `block_id` with `payload`, which must be exactly `block_size` bytes.
    pub fn write_block(&mut self, block_id: BlockId, payload: &[u8]) -> Result<(), OramError> {
        self.check_block_id(block_id)?;
        self.check_payload(payload)?;
        self.access(block_id, Some(payload))?;
        Ok(())
    }

    /// Writes `payloads[i]` to `block_ids[i]` for every `i`, in order.
    ///
    /// All arguments are checked before the first access.
    pub fn write_blocks(
        &mut self,
        block_ids: &[BlockId],
        payloads: &[Vec<u8>],
    ) -> Result<(), OramError> {
        if block_ids.len() != payloads.len() {
            return Err(OramError::InvalidArgumentError(format!(
                "{} block identifiers but {} payloads",
                block_ids.len(),
                payloads.len()
            )));
        }
        for (&block_id, payload) in block_ids.iter().zip(payloads) {
            self.check_block_id(block_id)?;
            self.check_payload(payload)?;
        }
        for (&block_id, payload) in block_ids.iter().zip(payloads) {
            self.access(block_id, Some(payload))?;
        }
        Ok(())
    }

    /// Replaces the caller-owned header bytes, which must keep their length.
    pub fn update_header_data(&mut self, new_header_data: &[u8]) -> Result<(), OramError> {
        if new_header_data.len() != self.user_header_data.len() {
            return Err(OramError::InvalidArgumentError(format!(
                "header data must be {} bytes, got {}",
                self.user_header_data.len(),
                new_header_data.len()
            )));
        }
        let (integrity, _) = IntegrityHeader::decode(self.storage.header_data())?;
        self.storage
            .update_header_data(&integrity.encode(new_header_data))?;
        self.user_header_data = new_header_data.to_vec();
        Ok(())
    }

    /// The caller-owned header bytes.
    pub fn header_data(&self) -> &[u8] {
        &self.user_header_data
    }

    /// The number of logical blocks.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// The size of each block in bytes.
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// The tree geometry.
    pub fn heap(&self) -> &VirtualHeap {
        &self.heap
    }

    /// The encryption key. Persist it to open the store again.
    pub fn key(&self) -> &[u8] {
        self.storage.key()
    }

    /// The bucket cipher.
    pub fn cipher_mode(&self) -> CipherMode {
        self.storage.cipher_mode()
    }

    /// The raw storage implementation.
    pub fn storage_type(&self) -> StorageType {
        self.storage.storage_type()
    }

    /// The stash.
    pub fn stash(&self) -> &Stash {
        &self.stash
    }

    /// The position map.
    pub fn position_map(&self) -> &PositionMap {
        &self.position_map
    }

    /// The number of tree levels held in memory.
    pub fn cached_levels(&self) -> TreeHeight {
        self.cached_levels
    }

    /// Buckets read from storage by this handle, cache loads included.
    pub fn bucket_reads(&self) -> u64 {
        self.storage.bucket_reads()
    }

    /// Buckets written to storage by this handle.
    pub fn bucket_writes(&self) -> u64 {
        self.storage.bucket_writes()
    }

    /// Raw bytes written to the backend by this handle.
    pub fn bytes_sent(&self) -> u64 {
        self.storage.bytes_sent()
    }

    /// Raw bytes read from the backend by this handle.
    pub fn bytes_received(&self) -> u64 {
        self.storage.bytes_received()
    }

    /// Records digests of the client state in the storage header, releases the lock,
    /// and returns the state. The caller must keep it to open the store again.
    ///
    /// # Errors
    ///
    /// Returns a `CorruptOramError` if an earlier access failed part-way. The storage is still
    /// released, but keeps the in-use record, so no state opens it again.
    pub fn close(mut self) -> Result<OramState, OramError> {
        self.closed = true;
        if self.poisoned {
            self.storage.close()?;
            return Err(OramError::CorruptOramError(
                "closed after a failed access; the store is unrecoverable".into(),
            ));
        }

        let state = OramState::new(
            std::mem::take(&mut self.stash),
            std::mem::take(&mut self.position_map),
        );
        let integrity = IntegrityHeader::for_state(&state)?;
        self.storage
            .update_header_data(&integrity.encode(&self.user_header_data))?;
        self.storage.close()?;

        log::info!("PathOram::close(stash size = {})", state.stash.len());
        Ok(state)
    }

    fn check_block_id(&self, block_id: BlockId) -> Result<(), OramError> {
        if block_id >= self.block_count {
            return Err(OramError::AddressOutOfBoundsError {
                block_id,
                block_count: self.block_count,
            });
        }
        Ok(())
    }

    fn check_payload(&self, payload: &[u8]) -> Result<(), OramError> {
        if payload.len() != self.block_size {
            return Err(OramError::InvalidArgumentError(format!(
                "payload must be {} bytes, got {}",
                self.block_size,
                payload.len()
            )));
        }
        Ok(())
    }

    /// Performs one Path ORAM access and returns the block's contents before the access.
    fn access(
        &mut self,
        block_id: BlockId,
        new_payload: Option<&[u8]>,
    ) -> Result<Vec<u8>, OramError> {
        if self.poisoned {
            return Err(OramError::CorruptOramError(
                "an earlier access failed part-way; the store is unrecoverable".into(),
            ));
        }
        if !self.in_use {
            self.mark_in_use()?;
        }

        let leaf = self.position_map.get(block_id)?;
        let path_indices = self.heap.path_buckets(leaf);
        let buckets = self.load_path(&path_indices)?;

        // From here on, a failure leaves the client state and the tree out of step.
        let result = self.evict_access(
            block_id,
            new_payload,
            LoadedPath::new(leaf, buckets),
            &path_indices,
        );
        if let Err(e) = &result {
            log::error!("Access to block {} failed part-way: {}", block_id, e);
            self.poisoned = true;
        }
        result
    }

    fn evict_access(
        &mut self,
        block_id: BlockId,
        new_payload: Option<&[u8]>,
        mut path: LoadedPath,
        path_indices: &[BucketIndex],
    ) -> Result<Vec<u8>, OramError> {
        let from_path = path.extract(block_id);
        let from_stash = self.stash.remove(block_id);
        let payload = match (from_path, from_stash) {
            (Some(payload), None) | (None, Some(payload)) => payload,
            (None, None) => {
                return Err(OramError::CorruptOramError(format!(
                    "block {block_id} is neither on the path to leaf {} nor in the stash",
                    path.leaf()
                )))
            }
            (Some(_), Some(_)) => {
                return Err(OramError::CorruptOramError(format!(
                    "block {block_id} is both on its path and in the stash"
                )))
            }
        };

        let stored = match new_payload {
            Some(new_payload) => new_payload.to_vec(),
            None => payload.clone(),
        };
        self.stash.insert(block_id, stored);

        let new_leaf = self.heap.random_leaf(&mut self.rng);
        self.position_map.set(block_id, new_leaf)?;

        path.push_down(&self.heap, &self.position_map, &mut self.stash)?;
        path.fill_from_stash(&self.heap, &self.position_map, &mut self.stash)?;
        self.write_path(path_indices, path.into_buckets())?;

        log::debug!(
            "Accessed block {} -- stash size {}",
            block_id,
            self.stash.len()
        );
        Ok(payload)
    }

    /// Replaces the recorded digests with the in-use record, before the tree is first modified.
    fn mark_in_use(&mut self) -> Result<(), OramError> {
        let record = IntegrityHeader::in_use(self.block_count);
        self.storage
            .update_header_data(&record.encode(&self.user_header_data))?;
        self.in_use = true;
        Ok(())
    }

    fn load_path(&mut self, path_indices: &[BucketIndex]) -> Result<Vec<Bucket>, OramError> {
        let mut result = Vec::with_capacity(path_indices.len());
        let mut uncached = Vec::new();
        for &index in path_indices {
            match self.cached(index)? {
                Some(cache_index) => result.push(self.cache[cache_index].clone()),
                None => uncached.push(index),
            }
        }
        // Cached buckets are the top of the path.
        result.extend(self.storage.read_buckets(&uncached)?);
        Ok(result)
    }

    /// Writes every bucket of the path back to storage. Cached buckets are written through.
    fn write_path(
        &mut self,
        path_indices: &[BucketIndex],
        buckets: Vec<Bucket>,
    ) -> Result<(), OramError> {
        self.storage.write_buckets(path_indices, &buckets)?;
        for (&index, bucket) in path_indices.iter().zip(buckets) {
            if let Some(cache_index) = self.cached(index)? {
                self.cache[cache_index] = bucket;
            }
        }
        Ok(())
    }

    fn cached(&self, index: BucketIndex) -> Result<Option<usize>, OramError> {
        let index = usize::try_from(index)?;
        Ok((index < self.cache.len()).then_some(index))
    }

    #[cfg(test)]
    pub(crate) fn storage_mut(&mut self) -> &mut EncryptedHeapStorage {
        &mut self.storage
    }
}

impl Drop for PathOram {
    fn drop(&mut self) {
        if !self.closed {
            log::warn!(
                "PathOram dropped without close; its stash ({} blocks) and position map are lost",
                self.stash.len()
            );
            if self.in_use {
                log::warn!("The store was accessed and cannot be opened again");
            }
        }
    }
}

/// Places each block, zeroed, in the deepest bucket on its path with a free slot.
/// Blocks that find no free slot go to the stash.
fn initial_placement(
    heap: &VirtualHeap,
    position_map: &PositionMap,
    block_size: BlockSize,
) -> Result<(BTreeMap<BucketIndex, Bucket>, Stash), OramError> {
    let mut buckets: BTreeMap<BucketIndex, Bucket> = BTreeMap::new();
    let mut stash = Stash::new();
    for (block_id, &leaf) in position_map.leaves().iter().enumerate() {
        let mut pending = Some(Block::new(
            BlockId::try_from(block_id)?,
            vec![0u8; block_size],
        ));
        for level in (0..heap.levels()).rev() {
            let Some(block) = pending.take() else {
                break;
            };
            pending = buckets
                .entry(heap.bucket_on_path(leaf, level))
                .or_insert_with(|| Bucket::empty(block_size, heap.blocks_per_bucket()))
                .insert(block)
                .err();
        }
        if let Some(block) = pending {
            stash.insert(block.block_id, block.payload);
        }
    }
    Ok((buckets, stash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        assert_reachability, create_correctness_test, create_correctness_tests_for_workload,
        init_logger, test_correctness_linear_workload, test_correctness_random_workload,
    };
    use std::fs;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::PathBuf;
    use tempfile::TempDir;

    create_correctness_tests_for_workload!(test_correctness_random_workload);
    create_correctness_tests_for_workload!(test_correctness_linear_workload);

    fn store_path() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        (dir, path)
    }

    fn small_options() -> SetupOptions {
        SetupOptions {
            bucket_capacity: 2,
            heap_base: 2,
            ..SetupOptions::default()
        }
    }

    fn reopen(path: &Path, state: OramState, key: &[u8]) -> Result<PathOram, OramError> {
        PathOram::open(path, state, key, OpenOptions::default())
    }

    #[duplicate::duplicate_item(
        module_name     tested_cipher       tested_storage;
        [ctr_file]      [CipherMode::Ctr]   [StorageType::File];
        [ctr_mmap]      [CipherMode::Ctr]   [StorageType::Mmap];
        [gcm_file]      [CipherMode::Gcm]   [StorageType::File];
        [gcm_mmap]      [CipherMode::Gcm]   [StorageType::Mmap];
    )]
    mod module_name {
        use super::*;

        #[test]
        fn forty_seven_blocks_in_any_order() {
            init_logger();
            let (_dir, path) = store_path();
            let options = SetupOptions {
                cipher_mode: tested_cipher,
                storage_type: tested_storage,
                ..small_options()
            };
            let mut oram = PathOram::setup(&path, 25, 47, options).unwrap();
            assert_eq!(oram.heap().height(), 6);

            for block_id in 0..47u64 {
                oram.write_block(block_id, &[block_id as u8; 25]).unwrap();
            }
            for block_id in 0..47u64 {
                assert_eq!(oram.read_block(block_id).unwrap(), vec![block_id as u8; 25]);
            }
            for block_id in (0..47u64).rev() {
                assert_eq!(oram.read_block(block_id).unwrap(), vec![block_id as u8; 25]);
            }
            let interleaved: Vec<BlockId> = (0..24u64)
                .flat_map(|i| [i, 46 - i])
                .take(47)
                .collect();
            let payloads = oram.read_blocks(&interleaved).unwrap();
            for (block_id, payload) in interleaved.iter().zip(payloads) {
                assert_eq!(payload, vec![*block_id as u8; 25]);
            }
            assert_reachability(&mut oram);

            let key = oram.key().to_vec();
            let state = oram.close().unwrap();
            let mut oram = PathOram::open(
                &path,
                state,
                &key,
                OpenOptions {
                    storage_type: tested_storage,
                    ..OpenOptions::default()
                },
            )
            .unwrap();
            assert_eq!(oram.cipher_mode(), tested_cipher);
            for block_id in 0..47u64 {
                assert_eq!(oram.read_block(block_id).unwrap(), vec![block_id as u8; 25]);
            }
        }
    }

    #[test]
    fn fresh_blocks_read_as_zeros() {
        let (_dir, path) = store_path();
        let mut oram = PathOram::setup(&path, 8, 10, small_options()).unwrap();
        assert_reachability(&mut oram);
        assert_eq!(oram.read_blocks(&[0, 9, 4]).unwrap(), vec![vec![0u8; 8]; 3]);
    }

    #[test]
    fn rejects_bad_arguments() {
        let (_dir, path) = store_path();
        let mut oram = PathOram::setup(&path, 8, 10, small_options()).unwrap();
        assert!(matches!(
            oram.read_block(10),
            Err(OramError::AddressOutOfBoundsError {
                block_id: 10,
                block_count: 10
            })
        ));
        assert!(matches!(
            oram.write_block(0, &[0u8; 9]),
            Err(OramError::InvalidArgumentError(_))
        ));
        assert!(matches!(
            oram.write_blocks(&[0, 1], &[vec![0u8; 8]]),
            Err(OramError::InvalidArgumentError(_))
        ));
        // Nothing is written when a later entry of a batch is bad.
        assert!(oram
            .write_blocks(&[0, 11], &[vec![1u8; 8], vec![1u8; 8]])
            .is_err());
        assert_eq!(oram.read_block(0).unwrap(), vec![0u8; 8]);
        assert!(oram.read_blocks(&[0, 10]).is_err());
    }

    #[test]
    fn rejects_bad_configurations() {
        let (_dir, path) = store_path();
        for (block_size, block_count, options) in [
            (8, 0, small_options()),
            (0, 8, small_options()),
            (
                8,
                8,
                SetupOptions {
                    heap_base: 1,
                    ..small_options()
                },
            ),
            (
                8,
                8,
                SetupOptions {
                    bucket_capacity: 0,
                    ..small_options()
                },
            ),
            (
                8,
                8,
                SetupOptions {
                    key_size: 20,
                    ..small_options()
                },
            ),
            (
                8,
                8,
                SetupOptions {
                    key: Some(vec![0u8; 7]),
                    ..small_options()
                },
            ),
        ] {
            assert!(matches!(
                PathOram::setup(&path, block_size, block_count, options),
                Err(OramError::InvalidConfigurationError(_))
            ));
        }
        assert!(!path.exists());
    }

    #[test]
    fn setup_does_not_overwrite_by_default() {
        let (_dir, path) = store_path();
        PathOram::setup(&path, 8, 4, small_options())
            .unwrap()
            .close()
            .unwrap();
        assert!(matches!(
            PathOram::setup(&path, 8, 4, small_options()),
            Err(OramError::AlreadyExistsError(_))
        ));
        let options = SetupOptions {
            ignore_existing: true,
            ..small_options()
        };
        PathOram::setup(&path, 8, 4, options).unwrap();
    }

    #[test]
    fn storage_size_matches_the_file() {
        let (_dir, path) = store_path();
        let options = SetupOptions {
            header_data: b"abc".to_vec(),
            cipher_mode: CipherMode::Ctr,
            ..small_options()
        };
        let total = PathOram::compute_storage_size(25, 47, &options, false).unwrap();
        let buckets = PathOram::compute_storage_size(25, 47, &options, true).unwrap();
        // 127 buckets of 2 slots, each slot an 8 byte identifier and 25 bytes of payload.
        assert_eq!(buckets, 127 * (16 + 2 * 33));

        PathOram::setup(&path, 25, 47, options)
            .unwrap()
            .close()
            .unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), total);
    }

    #[test]
    fn header_data_round_trip() {
        let (_dir, path) = store_path();
        let options = SetupOptions {
            header_data: b"version 1".to_vec(),
            ..small_options()
        };
        let mut oram = PathOram::setup(&path, 8, 4, options).unwrap();
        assert_eq!(oram.header_data(), b"version 1");
        oram.update_header_data(b"version 2").unwrap();
        assert!(matches!(
            oram.update_header_data(b"version 10"),
            Err(OramError::InvalidArgumentError(_))
        ));
        assert_eq!(oram.header_data(), b"version 2");

        let key = oram.key().to_vec();
        let state = oram.close().unwrap();
        let oram = reopen(&path, state, &key).unwrap();
        assert_eq!(oram.header_data(), b"version 2");
    }

    #[test]
    fn state_survives_serialization() {
        let (_dir, path) = store_path();
        let mut oram = PathOram::setup(&path, 8, 16, small_options()).unwrap();
        oram.write_block(3, b"abcdefgh").unwrap();
        let key = oram.key().to_vec();
        let bytes = oram.close().unwrap().to_bytes().unwrap();

        let mut oram = reopen(&path, OramState::from_bytes(&bytes).unwrap(), &key).unwrap();
        assert_eq!(oram.read_block(3).unwrap(), b"abcdefgh");
    }

    #[test]
    fn stale_or_tampered_state_is_rejected() {
        let (_dir, path) = store_path();
        let mut oram = PathOram::setup(&path, 8, 16, small_options()).unwrap();
        let key = oram.key().to_vec();
        oram.write_block(1, &[1u8; 8]).unwrap();
        let stale = OramState::new(oram.stash().clone(), oram.position_map().clone());
        for block_id in 2..10 {
            oram.write_block(block_id, &[block_id as u8; 8]).unwrap();
        }
        let leaf_count = oram.heap().leaf_count();
        let state = oram.close().unwrap();

        assert!(matches!(
            reopen(&path, stale, &key),
            Err(OramError::DigestMismatchError(_))
        ));

        let mut moved = state.clone();
        let leaf = moved.position_map.get(5).unwrap();
        moved
            .position_map
            .set(5, (leaf + 1) % leaf_count)
            .unwrap();
        assert!(matches!(
            reopen(&path, moved, &key),
            Err(OramError::DigestMismatchError("position map"))
        ));

        let mut extra = state.clone();
        extra.stash.insert(0, vec![0xab; 8]);
        assert!(matches!(
            reopen(&path, extra, &key),
            Err(OramError::DigestMismatchError(_))
        ));

        let mut out_of_range = state.clone();
        out_of_range.position_map.set(0, u64::MAX).unwrap();
        assert!(matches!(
            reopen(&path, out_of_range, &key),
            Err(OramError::InvalidStateError(_))
        ));

        let mut truncated = state.clone();
        truncated.position_map = PositionMap::from(vec![0; 15]);
        assert!(matches!(
            reopen(&path, truncated, &key),
            Err(OramError::InvalidStateError(_))
        ));

        // A failed open leaves the store unlocked.
        reopen(&path, state, &key).unwrap();
    }

    #[test]
    fn second_handle_is_locked_out() {
        let (_dir, path) = store_path();
        let oram = PathOram::setup(&path, 8, 4, small_options()).unwrap();
        let key = oram.key().to_vec();

        assert!(matches!(
            reopen(&path, OramState::default(), &key),
            Err(OramError::StorageLockedError(_))
        ));

        let state = oram.close().unwrap();
        let oram = reopen(&path, state.clone(), &key).unwrap();

        let bypass = PathOram::open(
            &path,
            state.clone(),
            &key,
            OpenOptions {
                ignore_lock: true,
                ..OpenOptions::default()
            },
        )
        .unwrap();
        drop(bypass);

        let state = oram.close().unwrap();
        reopen(&path, state, &key).unwrap().close().unwrap();
    }

    #[test]
    fn bad_keys_are_rejected() {
        for cipher_mode in [CipherMode::Ctr, CipherMode::Gcm] {
            let (_dir, path) = store_path();
            let options = SetupOptions {
                cipher_mode,
                key_size: 16,
                ..small_options()
            };
            let oram = PathOram::setup(&path, 8, 4, options).unwrap();
            assert_eq!(oram.key().len(), 16);
            let key = oram.key().to_vec();
            let state = oram.close().unwrap();

            assert!(matches!(
                reopen(&path, state.clone(), &[]),
                Err(OramError::InvalidArgumentError(_))
            ));
            let wrong_key: Vec<u8> = key.iter().map(|byte| byte ^ 0xff).collect();
            assert!(matches!(
                reopen(&path, state.clone(), &wrong_key),
                Err(OramError::BadKeyError)
            ));
            reopen(&path, state, &key).unwrap();
        }
    }

    #[test]
    fn supplied_key_is_used() {
        let (_dir, path) = store_path();
        let key = vec![7u8; 24];
        let options = SetupOptions {
            key: Some(key.clone()),
            ..small_options()
        };
        let oram = PathOram::setup(&path, 8, 4, options).unwrap();
        assert_eq!(oram.key(), key.as_slice());
        let state = oram.close().unwrap();
        reopen(&path, state, &key).unwrap();
    }

    #[test]
    fn tampered_bucket_is_reported() {
        let (_dir, path) = store_path();
        let options = small_options();
        let total = PathOram::compute_storage_size(8, 4, &options, false).unwrap();
        let buckets = PathOram::compute_storage_size(8, 4, &options, true).unwrap();
        let oram = PathOram::setup(&path, 8, 4, options).unwrap();
        let key = oram.key().to_vec();
        let state = oram.close().unwrap();

        // Every access reads the root bucket, the first bucket after the header.
        let offset = total - buckets + 30;
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&[byte[0] ^ 0x80]).unwrap();
        drop(file);

        let mut oram = reopen(&path, state, &key).unwrap();
        assert!(matches!(
            oram.read_block(0),
            Err(OramError::CorruptBucketError(_))
        ));
        assert!(matches!(
            oram.write_block(1, &[0u8; 8]),
            Err(OramError::CorruptBucketError(_))
        ));
    }

    #[test]
    fn every_access_touches_one_full_path() {
        let (_dir, path) = store_path();
        let mut oram = PathOram::setup(&path, 16, 100, small_options()).unwrap();
        let levels = oram.heap().levels();
        assert_eq!(levels, 8);
        // The first access also rewrites the header.
        oram.read_block(1).unwrap();

        for block_id in [0, 99, 0, 50, 50] {
            let (reads, writes) = (oram.bucket_reads(), oram.bucket_writes());
            let (received, sent) = (oram.bytes_received(), oram.bytes_sent());
            oram.read_block(block_id).unwrap();
            assert_eq!(oram.bucket_reads() - reads, levels);
            assert_eq!(oram.bucket_writes() - writes, levels);
            assert_eq!(oram.bytes_received() - received, oram.bytes_sent() - sent);
        }
    }

    #[test]
    fn cached_levels_are_served_from_memory() {
        let (_dir, path) = store_path();
        let options = SetupOptions {
            cached_levels: 3,
            ..small_options()
        };
        let mut oram = PathOram::setup(&path, 16, 100, options).unwrap();
        assert_eq!(oram.cached_levels(), 3);
        let levels = oram.heap().levels();

        for block_id in 0..20u64 {
            let (reads, writes) = (oram.bucket_reads(), oram.bucket_writes());
            oram.write_block(block_id, &[block_id as u8; 16]).unwrap();
            assert_eq!(oram.bucket_reads() - reads, levels - 3);
            assert_eq!(oram.bucket_writes() - writes, levels);
        }

        // Cached levels are written through, so an uncached handle sees the same tree.
        assert_reachability(&mut oram);
        let key = oram.key().to_vec();
        let state = oram.close().unwrap();
        let mut oram = reopen(&path, state, &key).unwrap();
        for block_id in 0..20u64 {
            assert_eq!(oram.read_block(block_id).unwrap(), vec![block_id as u8; 16]);
        }
    }

    #[test]
    fn cached_levels_are_clamped_to_the_tree() {
        let (_dir, path) = store_path();
        let options = SetupOptions {
            cached_levels: 100,
            ..small_options()
        };
        let mut oram = PathOram::setup(&path, 4, 8, options).unwrap();
        assert_eq!(oram.cached_levels(), oram.heap().levels());
        let reads = oram.bucket_reads();
        oram.write_block(3, &[3u8; 4]).unwrap();
        assert_eq!(oram.read_block(3).unwrap(), vec![3u8; 4]);
        assert_eq!(oram.bucket_reads(), reads);
    }

    #[test]
    fn stash_stays_small() {
        init_logger();
        let (_dir, path) = store_path();
        let mut oram = PathOram::setup(&path, 4, 128, SetupOptions::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut max_stash_size = 0;
        for _ in 0..2000 {
            let block_id = rand::Rng::gen_range(&mut rng, 0..128);
            oram.read_block(block_id).unwrap();
            max_stash_size = max_stash_size.max(oram.stash().len());
        }
        log::info!("Maximum stash size with Z = 4: {}", max_stash_size);
        assert!(max_stash_size <= 40);
    }

    #[test]
    fn lost_block_poisons_the_handle() {
        let (_dir, path) = store_path();
        let mut oram = PathOram::setup(&path, 8, 4, small_options()).unwrap();
        oram.write_block(2, &[2u8; 8]).unwrap();

        // Remove block 2 from the tree behind the handle's back.
        let heap = *oram.heap();
        let leaf = oram.position_map().get(2).unwrap();
        oram.stash.remove(2);
        for index in heap.path_buckets(leaf) {
            let mut bucket = oram.storage_mut().read_bucket(index).unwrap();
            bucket.take(2);
            oram.storage_mut().write_bucket(index, &bucket).unwrap();
        }

        assert!(matches!(
            oram.read_block(2),
            Err(OramError::CorruptOramError(_))
        ));
        assert!(matches!(
            oram.read_block(0),
            Err(OramError::CorruptOramError(_))
        ));
        assert!(matches!(
            oram.close(),
            Err(OramError::CorruptOramError(_))
        ));
        // The lock is released even so.
        assert!(!matches!(
            reopen(&path, OramState::default(), &[0u8; 32]),
            Err(OramError::StorageLockedError(_))
        ));
    }

    #[test]
    fn failed_session_cannot_be_reopened() {
        let (_dir, path) = store_path();
        let oram = PathOram::setup(&path, 8, 4, small_options()).unwrap();
        let key = oram.key().to_vec();
        let state = oram.close().unwrap();

        let mut oram = reopen(&path, state.clone(), &key).unwrap();
        oram.write_block(2, &[2u8; 8]).unwrap();
        let heap = *oram.heap();
        let leaf = oram.position_map().get(2).unwrap();
        oram.stash.remove(2);
        for index in heap.path_buckets(leaf) {
            let mut bucket = oram.storage_mut().read_bucket(index).unwrap();
            bucket.take(2);
            oram.storage_mut().write_bucket(index, &bucket).unwrap();
        }
        assert!(matches!(
            oram.read_block(2),
            Err(OramError::CorruptOramError(_))
        ));
        assert!(oram.close().is_err());

        // The state from before the session no longer describes the tree.
        assert!(matches!(
            reopen(&path, state, &key),
            Err(OramError::DigestMismatchError("state"))
        ));
    }

    #[test]
    fn dropped_session_cannot_be_reopened() {
        let (_dir, path) = store_path();
        let oram = PathOram::setup(&path, 8, 16, small_options()).unwrap();
        let key = oram.key().to_vec();
        let state = oram.close().unwrap();

        // A handle that never accessed the store leaves the recorded digests intact.
        drop(reopen(&path, state.clone(), &key).unwrap());

        let mut oram = reopen(&path, state.clone(), &key).unwrap();
        for block_id in 0..16u64 {
            oram.write_block(block_id, &[block_id as u8; 8]).unwrap();
        }
        drop(oram);

        assert!(matches!(
            reopen(&path, state, &key),
            Err(OramError::DigestMismatchError("state"))
        ));
    }
}
