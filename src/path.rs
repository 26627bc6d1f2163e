// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The in-memory working set of one Path ORAM access: the buckets of a single root-to-leaf path.

use crate::{
    bucket::{Block, Bucket},
    position_map::PositionMap,
    stash::Stash,
    virtual_heap::VirtualHeap,
    BlockId, LeafIndex, OramError, TreeHeight,
};
use std::cmp::Reverse;
use std::collections::VecDeque;

/// The buckets on the path to `leaf`, indexed by level (the root is at index 0).
#[derive(Debug)]
pub(crate) struct LoadedPath {
    leaf: LeafIndex,
    buckets: Vec<Bucket>,
}

impl LoadedPath {
    pub(crate) fn new(leaf: LeafIndex, buckets: Vec<Bucket>) -> Self {
        Self { leaf, buckets }
    }

    pub(crate) fn leaf(&self) -> LeafIndex {
        self.leaf
    }

    pub(crate) fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub(crate) fn into_buckets(self) -> Vec<Bucket> {
        self.buckets
    }

    /// Removes block `block_id` from the path. Every bucket is scanned whether or not the block is found.
    pub(crate) fn extract(&mut self, block_id: BlockId) -> Option<Vec<u8>> {
        let mut result = None;
        for bucket in self.buckets.iter_mut() {
            if let Some(block) = bucket.take(block_id) {
                result = Some(block.payload);
            }
        }
        result
    }

    fn eviction_level(
        &self,
        heap: &VirtualHeap,
        position_map: &PositionMap,
        block_id: BlockId,
    ) -> Result<TreeHeight, OramError> {
        Ok(heap.last_common_level(self.leaf, position_map.get(block_id)?))
    }

    /// Moves every block on the path as deep as its eviction level allows.
    ///
    /// Levels are filled from the leaf upwards. A level takes the pending blocks with the deepest
    /// eviction levels first, among those allowed to sit at that level.
    pub(crate) fn push_down(
        &mut self,
        heap: &VirtualHeap,
        position_map: &PositionMap,
        stash: &mut Stash,
    ) -> Result<(), OramError> {
        let mut pending = Vec::new();
        for bucket in self.buckets.iter_mut() {
            pending.extend(bucket.take_all());
        }
        let mut pending = pending
            .into_iter()
            .map(|block| Ok((self.eviction_level(heap, position_map, block.block_id)?, block)))
            .collect::<Result<Vec<(TreeHeight, Block)>, OramError>>()?;
        pending.sort_by_key(|(level, block)| (Reverse(*level), block.block_id));
        let mut pending = VecDeque::from(pending);

        for (level, bucket) in self.buckets.iter_mut().enumerate().rev() {
            let level = TreeHeight::try_from(level)?;
            while bucket.has_vacancy()
                && pending
                    .front()
                    .is_some_and(|(eviction_level, _)| *eviction_level >= level)
            {
                let Some((eviction_level, block)) = pending.pop_front() else {
                    break;
                };
                if let Err(block) = bucket.insert(block) {
                    pending.push_front((eviction_level, block));
                    break;
                }
            }
        }

        for (_, block) in pending {
            log::warn!(
                "Block {} did not fit back on the path to leaf {}",
                block.block_id,
                self.leaf
            );
            stash.insert(block.block_id, block.payload);
        }
        Ok(())
    }

    /// Moves stashed blocks onto the path, each into the deepest vacant bucket its eviction level allows.
    pub(crate) fn fill_from_stash(
        &mut self,
        heap: &VirtualHeap,
        position_map: &PositionMap,
        stash: &mut Stash,
    ) -> Result<(), OramError> {
        let mut candidates = stash
            .block_ids()
            .map(|block_id| Ok((self.eviction_level(heap, position_map, block_id)?, block_id)))
            .collect::<Result<Vec<(TreeHeight, BlockId)>, OramError>>()?;
        candidates.sort_by_key(|&(level, block_id)| (Reverse(level), block_id));

        for (eviction_level, block_id) in candidates {
            let deepest = usize::try_from(eviction_level)?;
            let Some(level) = (0..=deepest)
                .rev()
                .find(|&level| self.buckets[level].has_vacancy())
            else {
                continue;
            };
            if let Some(payload) = stash.remove(block_id) {
                if let Err(block) = self.buckets[level].insert(Block::new(block_id, payload)) {
                    stash.insert(block.block_id, block.payload);
                }
            }
            if self.buckets.iter().all(|bucket| !bucket.has_vacancy()) {
                break;
            }
        }
        Ok(())
    }
}
