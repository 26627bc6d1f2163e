// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Block and bucket structures for Path ORAM, and their fixed-width plaintext encoding.

use crate::{BlockId, BlockSize, BucketSize, OramError};
use std::mem::size_of;
use subtle::ConstantTimeEq;

/// The block identifier marking an empty bucket slot.
pub const EMPTY_BLOCK_ID: BlockId = BlockId::MAX;

const BLOCK_ID_LEN: usize = size_of::<BlockId>();

#[derive(Clone, PartialEq, Eq)]
/// A logical block: an identifier and an opaque, fixed-size payload.
pub struct Block {
    /// The block's identifier, or [`EMPTY_BLOCK_ID`] for a dummy block.
    pub block_id: BlockId,
    /// The block's contents.
    pub payload: Vec<u8>,
}

impl Block {
    /// Creates a real block.
    pub fn new(block_id: BlockId, payload: Vec<u8>) -> Self {
        Self { block_id, payload }
    }

    /// Creates a dummy block occupying an empty slot.
    pub fn dummy(block_size: BlockSize) -> Self {
        Self {
            block_id: EMPTY_BLOCK_ID,
            payload: vec![0u8; block_size],
        }
    }

    /// Returns whether this block marks an empty slot.
    pub fn is_dummy(&self) -> bool {
        self.block_id == EMPTY_BLOCK_ID
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_dummy() {
            write!(f, "Block::Dummy")
        } else {
            f.debug_struct("Block")
                .field("block_id", &self.block_id)
                .field("payload_len", &self.payload.len())
                .finish()
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
/// A Path ORAM bucket: exactly `Z` slots, each holding a real or a dummy block.
pub struct Bucket {
    pub(crate) blocks: Vec<Block>,
}

impl Bucket {
    /// Creates a bucket of `bucket_capacity` dummy blocks.
    pub fn empty(block_size: BlockSize, bucket_capacity: BucketSize) -> Self {
        Self {
            blocks: vec![Block::dummy(block_size); bucket_capacity],
        }
    }

    /// The slots of this bucket, dummies included.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The number of slots.
    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    /// The number of real blocks.
    pub fn occupancy(&self) -> usize {
        self.blocks.iter().filter(|block| !block.is_dummy()).count()
    }

    /// Returns whether at least one slot is empty.
    pub fn has_vacancy(&self) -> bool {
        self.blocks.iter().any(Block::is_dummy)
    }

    /// Returns whether the bucket holds the block `block_id`.
    pub fn contains(&self, block_id: BlockId) -> bool {
        self.blocks.iter().any(|block| block.block_id == block_id)
    }

    /// Places `block` in the first empty slot. Hands the block back if the bucket is full.
    pub fn insert(&mut self, block: Block) -> Result<(), Block> {
        match self.blocks.iter_mut().find(|slot| slot.is_dummy()) {
            Some(slot) => {
                *slot = block;
                Ok(())
            }
            None => Err(block),
        }
    }

    /// Removes the block `block_id` from the bucket, leaving a dummy in its slot.
    pub fn take(&mut self, block_id: BlockId) -> Option<Block> {
        // Every slot is compared so that the scan does not stop early at the match.
        let mut found = None;
        for (index, block) in self.blocks.iter().enumerate() {
            if bool::from(block.block_id.ct_eq(&block_id)) {
                found = Some(index);
            }
        }
        let index = found?;
        let block_size = self.blocks[index].payload.len();
        Some(std::mem::replace(
            &mut self.blocks[index],
            Block::dummy(block_size),
        ))
    }

    /// Removes and returns all real blocks, leaving the bucket empty.
    pub fn take_all(&mut self) -> Vec<Block> {
        let mut result = Vec::new();
        for slot in self.blocks.iter_mut() {
            if !slot.is_dummy() {
                let block_size = slot.payload.len();
                result.push(std::mem::replace(slot, Block::dummy(block_size)));
            }
        }
        result
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.blocks.iter().all(Block::is_dummy) {
            write!(f, "Bucket::Dummy")
        } else {
            f.debug_struct("Bucket")
                .field("blocks", &self.blocks)
                .finish()
        }
    }
}

/// Fixed-width (de)serialization of buckets.
///
/// A bucket encodes as `bucket_capacity` slots, each a little-endian `u64` block identifier
/// followed by `block_size` payload bytes. Empty slots carry [`EMPTY_BLOCK_ID`] and a zero payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketCodec {
    block_size: BlockSize,
    bucket_capacity: BucketSize,
}

impl BucketCodec {
    /// Returns a codec for buckets of `bucket_capacity` blocks of `block_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if either parameter is 0 or the encoded bucket is too large.
    pub fn new(block_size: BlockSize, bucket_capacity: BucketSize) -> Result<Self, OramError> {
        if block_size < 1 {
            return Err(OramError::InvalidConfigurationError(
                "block size must be at least 1".into(),
            ));
        }
        if bucket_capacity < 1 {
            return Err(OramError::InvalidConfigurationError(
                "bucket capacity must be at least 1".into(),
            ));
        }
        block_size
            .checked_add(BLOCK_ID_LEN)
            .and_then(|slot_len| slot_len.checked_mul(bucket_capacity))
            .ok_or_else(|| OramError::InvalidConfigurationError("bucket is too large".into()))?;

        Ok(Self {
            block_size,
            bucket_capacity,
        })
    }

    /// The payload size of each block.
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// The number of slots per bucket.
    pub fn bucket_capacity(&self) -> BucketSize {
        self.bucket_capacity
    }

    /// The encoded length of one slot.
    pub fn slot_len(&self) -> usize {
        BLOCK_ID_LEN + self.block_size
    }

    /// The encoded length of one bucket.
    pub fn encoded_len(&self) -> usize {
        self.slot_len() * self.bucket_capacity
    }

    /// Returns a bucket with every slot empty.
    pub fn empty_bucket(&self) -> Bucket {
        Bucket::empty(self.block_size, self.bucket_capacity)
    }

    /// Encodes `bucket`.
    ///
    /// # Errors
    ///
    /// Returns a `CorruptBucketError` if `bucket` does not have this codec's slot count and payload size.
    pub fn encode(&self, bucket: &Bucket) -> Result<Vec<u8>, OramError> {
        if bucket.blocks.len() != self.bucket_capacity {
            return Err(OramError::CorruptBucketError(format!(
                "expected {} slots, found {}",
                self.bucket_capacity,
                bucket.blocks.len()
            )));
        }

        let mut result = Vec::with_capacity(self.encoded_len());
        for block in &bucket.blocks {
            if block.payload.len() != self.block_size {
                return Err(OramError::CorruptBucketError(format!(
                    "expected payloads of {} bytes, found {}",
                    self.block_size,
                    block.payload.len()
                )));
            }
            result.extend_from_slice(&block.block_id.to_le_bytes());
            if block.is_dummy() {
                result.resize(result.len() + self.block_size, 0);
            } else {
                result.extend_from_slice(&block.payload);
            }
        }
        Ok(result)
    }

    /// Decodes a bucket from `bytes`.
    ///
    /// # Errors
    ///
    /// Returns a `CorruptBucketError` if `bytes` is not exactly one encoded bucket.
    pub fn decode(&self, bytes: &[u8]) -> Result<Bucket, OramError> {
        if bytes.len() != self.encoded_len() {
            return Err(OramError::CorruptBucketError(format!(
                "expected {} bytes, found {}",
                self.encoded_len(),
                bytes.len()
            )));
        }

        let blocks = bytes
            .chunks_exact(self.slot_len())
            .map(|slot| {
                let (id_bytes, payload) = slot.split_at(BLOCK_ID_LEN);
                let mut id = [0u8; BLOCK_ID_LEN];
                id.copy_from_slice(id_bytes);
                Block::new(BlockId::from_le_bytes(id), payload.to_vec())
            })
            .collect();
        Ok(Bucket { blocks })
    }
}
