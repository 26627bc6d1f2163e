// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Client state snapshots and the digests that tie them to the storage.
//!
//! When a [`crate::PathOram`] is closed, SHA-256 digests of its stash and position map are
//! written into the encrypted storage header and the state itself is handed to the caller.
//! On the next open, the state supplied by the caller must match those digests.
//! Before its first access, a handle overwrites the digests with an in-use record that no
//! state matches, so a store whose session ended without a clean close cannot be reopened.

use crate::{
    position_map::PositionMap, stash::Stash, virtual_heap::VirtualHeap, BlockSize, OramError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// The length of a state digest.
pub const DIGEST_LEN: usize = 32;

/// A SHA-256 digest of one half of the client state.
pub type StateDigest = [u8; DIGEST_LEN];

const STASH_DOMAIN: &[u8] = b"oram-store stash";
const POSITION_MAP_DOMAIN: &[u8] = b"oram-store position map";

fn tagged_digest(domain: &[u8], bytes: &[u8]) -> StateDigest {
    let mut hasher = Sha256::new();
    hasher.update((domain.len() as u64).to_le_bytes());
    hasher.update(domain);
    hasher.update(bytes);
    hasher.finalize().into()
}

/// The digest of `stash`.
pub fn stash_digest(stash: &Stash) -> Result<StateDigest, OramError> {
    Ok(tagged_digest(STASH_DOMAIN, &bincode::serialize(stash)?))
}

/// The digest of `position_map`.
pub fn position_map_digest(position_map: &PositionMap) -> Result<StateDigest, OramError> {
    Ok(tagged_digest(
        POSITION_MAP_DOMAIN,
        &bincode::serialize(position_map)?,
    ))
}

/// Compares two digests in constant time.
pub fn digests_match(a: &StateDigest, b: &StateDigest) -> bool {
    a[..].ct_eq(&b[..]).into()
}

/// The client-side state of a Path ORAM, owned by the caller between sessions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OramState {
    /// Blocks not stored in any bucket.
    pub stash: Stash,
    /// The leaf assigned to each block.
    pub position_map: PositionMap,
}

impl OramState {
    /// Bundles a stash and a position map.
    pub fn new(stash: Stash, position_map: PositionMap) -> Self {
        Self {
            stash,
            position_map,
        }
    }

    /// Serializes the state for the caller to persist.
    pub fn to_bytes(&self) -> Result<Vec<u8>, OramError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes a state produced by [`OramState::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OramError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Checks that every entry of the state is consistent with the store's geometry.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidStateError` naming the first offending entry.
    pub fn validate(
        &self,
        heap: &VirtualHeap,
        block_count: u64,
        block_size: BlockSize,
    ) -> Result<(), OramError> {
        if u64::try_from(self.position_map.len())? != block_count {
            return Err(OramError::InvalidStateError(format!(
                "position map has {} entries for {} blocks",
                self.position_map.len(),
                block_count
            )));
        }
        let leaves = self.position_map.leaves();
        if let Some(block_id) = leaves.iter().position(|&leaf| leaf >= heap.leaf_count()) {
            return Err(OramError::InvalidStateError(format!(
                "block {block_id} is mapped to leaf {}, but the tree has {} leaves",
                leaves[block_id],
                heap.leaf_count()
            )));
        }
        for (block_id, payload) in self.stash.iter() {
            if block_id >= block_count {
                return Err(OramError::InvalidStateError(format!(
                    "stash holds block {block_id}, but the store has {block_count} blocks"
                )));
            }
            if payload.len() != block_size {
                return Err(OramError::InvalidStateError(format!(
                    "stashed block {block_id} has {} bytes, expected {block_size}",
                    payload.len()
                )));
            }
        }
        Ok(())
    }
}

/// The integrity record kept at the front of the caller-visible storage header.
///
/// Encoded as `block_count (u64 LE) | stash digest | position map digest`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntegrityHeader {
    /// The number of logical blocks in the store.
    pub block_count: u64,
    /// The digest of the stash at the last close.
    pub stash_digest: StateDigest,
    /// The digest of the position map at the last close.
    pub position_map_digest: StateDigest,
}

impl IntegrityHeader {
    /// The encoded length.
    pub const LEN: usize = 8 + 2 * DIGEST_LEN;

    /// Records the digests of `state`.
    pub fn for_state(state: &OramState) -> Result<Self, OramError> {
        Ok(Self {
            block_count: u64::try_from(state.position_map.len())?,
            stash_digest: stash_digest(&state.stash)?,
            position_map_digest: position_map_digest(&state.position_map)?,
        })
    }

    /// The record kept while a handle may be modifying the tree. It matches no state.
    pub fn in_use(block_count: u64) -> Self {
        Self {
            block_count,
            stash_digest: [0u8; DIGEST_LEN],
            position_map_digest: [0u8; DIGEST_LEN],
        }
    }

    /// Whether this is an [`IntegrityHeader::in_use`] record.
    pub fn is_in_use(&self) -> bool {
        self.stash_digest == [0u8; DIGEST_LEN] && self.position_map_digest == [0u8; DIGEST_LEN]
    }

    /// Encodes the record followed by `user_header_data`.
    pub fn encode(&self, user_header_data: &[u8]) -> Vec<u8> {
        let mut result = Vec::with_capacity(Self::LEN + user_header_data.len());
        result.extend_from_slice(&self.block_count.to_le_bytes());
        result.extend_from_slice(&self.stash_digest);
        result.extend_from_slice(&self.position_map_digest);
        result.extend_from_slice(user_header_data);
        result
    }

    /// Splits `bytes` into the record and the user header data that follows it.
    ///
    /// # Errors
    ///
    /// Returns a `FormatError` if `bytes` is too short to hold a record.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), OramError> {
        if bytes.len() < Self::LEN {
            return Err(OramError::FormatError(format!(
                "integrity header needs {} bytes, found {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let (record, user_header_data) = bytes.split_at(Self::LEN);
        let mut block_count = [0u8; 8];
        block_count.copy_from_slice(&record[..8]);
        let mut stash_digest = [0u8; DIGEST_LEN];
        stash_digest.copy_from_slice(&record[8..8 + DIGEST_LEN]);
        let mut position_map_digest = [0u8; DIGEST_LEN];
        position_map_digest.copy_from_slice(&record[8 + DIGEST_LEN..]);
        Ok((
            Self {
                block_count: u64::from_le_bytes(block_count),
                stash_digest,
                position_map_digest,
            },
            user_header_data,
        ))
    }

    /// Checks `state` against the recorded digests.
    ///
    /// # Errors
    ///
    /// Returns a `DigestMismatchError` naming the half of the state that does not match,
    /// or naming the whole state if the store was not closed cleanly.
    pub fn verify(&self, state: &OramState) -> Result<(), OramError> {
        if self.is_in_use() {
            return Err(OramError::DigestMismatchError("state"));
        }
        if !digests_match(&stash_digest(&state.stash)?, &self.stash_digest) {
            return Err(OramError::DigestMismatchError("stash"));
        }
        if !digests_match(
            &position_map_digest(&state.position_map)?,
            &self.position_map_digest,
        ) {
            return Err(OramError::DigestMismatchError("position map"));
        }
        Ok(())
    }
}
