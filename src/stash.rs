// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM stash: blocks that are not currently stored in any bucket.

use crate::BlockId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Overflow blocks, keyed by block identifier.
///
/// The map is ordered so that the serialized form, and hence its digest, is canonical.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stash {
    blocks: BTreeMap<BlockId, Vec<u8>>,
}

impl Stash {
    /// Returns an empty stash.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of blocks in the stash.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns whether the stash is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Returns whether the stash holds block `block_id`.
    pub fn contains(&self, block_id: BlockId) -> bool {
        self.blocks.contains_key(&block_id)
    }

    /// The payload of block `block_id`, if stashed.
    pub fn get(&self, block_id: BlockId) -> Option<&[u8]> {
        self.blocks.get(&block_id).map(Vec::as_slice)
    }

    /// Stashes a block, returning the payload it replaced.
    pub fn insert(&mut self, block_id: BlockId, payload: Vec<u8>) -> Option<Vec<u8>> {
        self.blocks.insert(block_id, payload)
    }

    /// Removes block `block_id` from the stash.
    pub fn remove(&mut self, block_id: BlockId) -> Option<Vec<u8>> {
        self.blocks.remove(&block_id)
    }

    /// The stashed block identifiers, in increasing order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys().copied()
    }

    /// The stashed blocks, in increasing identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &[u8])> + '_ {
        self.blocks
            .iter()
            .map(|(&block_id, payload)| (block_id, payload.as_slice()))
    }
}

impl FromIterator<(BlockId, Vec<u8>)> for Stash {
    fn from_iter<I: IntoIterator<Item = (BlockId, Vec<u8>)>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}
