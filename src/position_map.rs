// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM position map, held by the client.

use crate::{virtual_heap::VirtualHeap, BlockId, LeafIndex, OramError};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// The leaf currently assigned to each block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionMap {
    leaves: Vec<LeafIndex>,
}

impl PositionMap {
    /// Assigns each of `block_count` blocks an independent uniformly random leaf of `heap`.
    pub fn random<R: RngCore + CryptoRng>(
        block_count: u64,
        heap: &VirtualHeap,
        rng: &mut R,
    ) -> Result<Self, OramError> {
        let mut leaves = Vec::with_capacity(usize::try_from(block_count)?);
        for _ in 0..block_count {
            leaves.push(heap.random_leaf(rng));
        }
        Ok(Self { leaves })
    }

    /// The number of blocks.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Returns whether the map holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// The leaf assigned to `block_id`.
    ///
    /// # Errors
    ///
    /// Returns an `AddressOutOfBoundsError` if `block_id` is not in the map.
    pub fn get(&self, block_id: BlockId) -> Result<LeafIndex, OramError> {
        let index = self.index(block_id)?;
        Ok(self.leaves[index])
    }

    /// Assigns `leaf` to `block_id` and returns the previous leaf.
    pub fn set(&mut self, block_id: BlockId, leaf: LeafIndex) -> Result<LeafIndex, OramError> {
        let index = self.index(block_id)?;
        Ok(std::mem::replace(&mut self.leaves[index], leaf))
    }

    /// The leaves of all blocks, indexed by block identifier.
    pub fn leaves(&self) -> &[LeafIndex] {
        &self.leaves
    }

    fn index(&self, block_id: BlockId) -> Result<usize, OramError> {
        let block_count = u64::try_from(self.leaves.len())?;
        if block_id >= block_count {
            return Err(OramError::AddressOutOfBoundsError {
                block_id,
                block_count,
            });
        }
        Ok(usize::try_from(block_id)?)
    }
}

impl From<Vec<LeafIndex>> for PositionMap {
    fn from(leaves: Vec<LeafIndex>) -> Self {
        Self { leaves }
    }
}
