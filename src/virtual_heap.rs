// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Geometry of a complete `k`-ary tree stored as a heap.
//!
//! Buckets are numbered in heap order: the root is bucket 0 and the children of
//! bucket `b` are buckets `k * b + 1` through `k * b + k`. Leaves are numbered
//! separately, from 0 at the leftmost leaf to `leaf_count - 1`.

use crate::{BucketIndex, BucketSize, HeapBase, LeafIndex, OramError, TreeHeight};
use rand::{CryptoRng, Rng};

/// Returns the number of buckets on `level` of a `k`-ary heap, or `None` on overflow.
pub fn bucket_count_at_level(k: HeapBase, level: TreeHeight) -> Option<BucketIndex> {
    k.checked_pow(u32::try_from(level).ok()?)
}

/// Returns the index of the leftmost bucket on `level` of a `k`-ary heap, or `None` on overflow.
pub fn first_bucket_at_level(k: HeapBase, level: TreeHeight) -> Option<BucketIndex> {
    // (k^level - 1) / (k - 1), computed without the intermediate power overflowing early.
    let mut first: BucketIndex = 0;
    let mut width: BucketIndex = 1;
    for _ in 0..level {
        first = first.checked_add(width)?;
        width = width.checked_mul(k)?;
    }
    Some(first)
}

/// Returns the level of `bucket` in a `k`-ary heap.
pub fn calculate_bucket_level(k: HeapBase, bucket: BucketIndex) -> TreeHeight {
    let mut level = 0;
    let mut first: BucketIndex = 0;
    let mut width: BucketIndex = 1;
    while bucket - first >= width {
        first += width;
        width = width.saturating_mul(k);
        level += 1;
    }
    level
}

/// Returns the parent of a non-root `bucket` in a `k`-ary heap.
pub fn calculate_parent_bucket(k: HeapBase, bucket: BucketIndex) -> BucketIndex {
    assert_ne!(bucket, 0);
    (bucket - 1) / k
}

/// Returns child number `child` (counting from 0) of `bucket` in a `k`-ary heap.
pub fn calculate_child_bucket(k: HeapBase, bucket: BucketIndex, child: u64) -> BucketIndex {
    assert!(child < k);
    k * bucket + 1 + child
}

/// Returns the level of the deepest bucket that is an ancestor of (or equal to) both `bucket_a` and `bucket_b`.
pub fn calculate_last_common_level(
    k: HeapBase,
    mut bucket_a: BucketIndex,
    mut bucket_b: BucketIndex,
) -> TreeHeight {
    let mut level_a = calculate_bucket_level(k, bucket_a);
    let mut level_b = calculate_bucket_level(k, bucket_b);
    while level_a > level_b {
        bucket_a = calculate_parent_bucket(k, bucket_a);
        level_a -= 1;
    }
    while level_b > level_a {
        bucket_b = calculate_parent_bucket(k, bucket_b);
        level_b -= 1;
    }
    while bucket_a != bucket_b {
        bucket_a = calculate_parent_bucket(k, bucket_a);
        bucket_b = calculate_parent_bucket(k, bucket_b);
        level_a -= 1;
    }
    level_a
}

/// Returns the smallest height `h` such that a `k`-ary tree of height `h` has at least `leaf_count` leaves.
pub fn calculate_necessary_heap_height(k: HeapBase, leaf_count: u64) -> TreeHeight {
    let mut height = 0;
    let mut leaves: u64 = 1;
    while leaves < leaf_count {
        leaves = leaves.saturating_mul(k);
        height += 1;
    }
    height
}

/// The shape of a complete `heap_base`-ary tree of buckets, each holding `blocks_per_bucket` blocks.
///
/// A `VirtualHeap` holds no data. It is recomputed from the storage header on every open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualHeap {
    heap_base: HeapBase,
    height: TreeHeight,
    blocks_per_bucket: BucketSize,
    leaf_count: u64,
    bucket_count: u64,
    first_leaf_bucket: BucketIndex,
}

impl VirtualHeap {
    /// Returns the geometry of a tree with the given branching factor, height and bucket capacity.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `heap_base < 2`, `blocks_per_bucket < 1`,
    /// or the tree has too many buckets to address.
    pub fn new(
        heap_base: HeapBase,
        height: TreeHeight,
        blocks_per_bucket: BucketSize,
    ) -> Result<Self, OramError> {
        if heap_base < 2 {
            return Err(OramError::InvalidConfigurationError(format!(
                "heap base must be at least 2, got {heap_base}"
            )));
        }
        if blocks_per_bucket < 1 {
            return Err(OramError::InvalidConfigurationError(
                "bucket capacity must be at least 1".into(),
            ));
        }

        let too_large = || {
            OramError::InvalidConfigurationError(format!(
                "a tree of base {heap_base} and height {height} is too large"
            ))
        };
        let leaf_count = bucket_count_at_level(heap_base, height).ok_or_else(too_large)?;
        let first_leaf_bucket = first_bucket_at_level(heap_base, height).ok_or_else(too_large)?;
        let bucket_count = first_leaf_bucket
            .checked_add(leaf_count)
            .ok_or_else(too_large)?;

        Ok(Self {
            heap_base,
            height,
            blocks_per_bucket,
            leaf_count,
            bucket_count,
            first_leaf_bucket,
        })
    }

    /// Returns the geometry of the smallest tree with at least one leaf per block.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `block_count < 1`, or for the reasons listed in [`VirtualHeap::new`].
    pub fn for_block_count(
        heap_base: HeapBase,
        block_count: u64,
        blocks_per_bucket: BucketSize,
    ) -> Result<Self, OramError> {
        if block_count < 1 {
            return Err(OramError::InvalidConfigurationError(
                "block count must be at least 1".into(),
            ));
        }
        if heap_base < 2 {
            return Err(OramError::InvalidConfigurationError(format!(
                "heap base must be at least 2, got {heap_base}"
            )));
        }
        let height = calculate_necessary_heap_height(heap_base, block_count);
        Self::new(heap_base, height, blocks_per_bucket)
    }

    /// The branching factor `k` of the tree.
    pub fn heap_base(&self) -> HeapBase {
        self.heap_base
    }

    /// The level of the leaves. A tree consisting of only a root has height 0.
    pub fn height(&self) -> TreeHeight {
        self.height
    }

    /// The number of levels, `height + 1`.
    pub fn levels(&self) -> TreeHeight {
        self.height + 1
    }

    /// The parameter "Z": the number of block slots in each bucket.
    pub fn blocks_per_bucket(&self) -> BucketSize {
        self.blocks_per_bucket
    }

    /// The number of leaves, `k^height`.
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// The total number of buckets in the tree.
    pub fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    /// The number of block slots on one root-to-leaf path.
    pub fn path_slot_count(&self) -> usize {
        // The height is bounded by 64 because the bucket count fits in a u64.
        (self.height as usize + 1) * self.blocks_per_bucket
    }

    /// The index of the leftmost bucket on `level`.
    pub fn first_bucket_at_level(&self, level: TreeHeight) -> BucketIndex {
        assert!(level <= self.height);
        // Cannot overflow: bounded by the bucket count, checked in `new`.
        first_bucket_at_level(self.heap_base, level).unwrap_or(BucketIndex::MAX)
    }

    /// The number of buckets on `level`.
    pub fn bucket_count_at_level(&self, level: TreeHeight) -> u64 {
        assert!(level <= self.height);
        self.heap_base.pow(level as u32)
    }

    /// The bucket index of `leaf`.
    pub fn leaf_bucket(&self, leaf: LeafIndex) -> BucketIndex {
        assert!(leaf < self.leaf_count);
        self.first_leaf_bucket + leaf
    }

    /// The level of `bucket`.
    pub fn bucket_level(&self, bucket: BucketIndex) -> TreeHeight {
        assert!(bucket < self.bucket_count);
        calculate_bucket_level(self.heap_base, bucket)
    }

    /// Splits `bucket` into its level and its offset within that level.
    pub fn bucket_position(&self, bucket: BucketIndex) -> (TreeHeight, u64) {
        let level = self.bucket_level(bucket);
        (level, bucket - self.first_bucket_at_level(level))
    }

    /// The bucket at `level` on the path from the root to `leaf`.
    pub fn bucket_on_path(&self, leaf: LeafIndex, level: TreeHeight) -> BucketIndex {
        assert!(leaf < self.leaf_count);
        assert!(level <= self.height);
        let offset = leaf / self.heap_base.pow((self.height - level) as u32);
        self.first_bucket_at_level(level) + offset
    }

    /// The buckets on the path from the root to `leaf`, root first.
    pub fn path_buckets(&self, leaf: LeafIndex) -> Vec<BucketIndex> {
        (0..=self.height)
            .map(|level| self.bucket_on_path(leaf, level))
            .collect()
    }

    /// Returns whether `bucket` lies on the path from the root to `leaf`.
    pub fn is_on_path(&self, bucket: BucketIndex, leaf: LeafIndex) -> bool {
        let level = self.bucket_level(bucket);
        self.bucket_on_path(leaf, level) == bucket
    }

    /// Returns a uniformly random leaf. `rng` must be cryptographically secure,
    /// since the sequence of leaves is exactly what an observer of the storage sees.
    pub fn random_leaf<R: Rng + CryptoRng>(&self, rng: &mut R) -> LeafIndex {
        rng.gen_range(0..self.leaf_count)
    }

    /// Returns the bucket index of a uniformly random leaf.
    pub fn random_leaf_bucket<R: Rng + CryptoRng>(&self, rng: &mut R) -> BucketIndex {
        self.leaf_bucket(self.random_leaf(rng))
    }

    /// Returns the level of the deepest bucket shared by the paths to `leaf_a` and `leaf_b`.
    ///
    /// A block mapped to `leaf_b` may be stored on the path to `leaf_a` at any level up to this one.
    pub fn last_common_level(&self, leaf_a: LeafIndex, leaf_b: LeafIndex) -> TreeHeight {
        assert!(leaf_a < self.leaf_count);
        assert!(leaf_b < self.leaf_count);
        let (mut a, mut b, mut level) = (leaf_a, leaf_b, self.height);
        while a != b {
            a /= self.heap_base;
            b /= self.heap_base;
            level -= 1;
        }
        level
    }
}
