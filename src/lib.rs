// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An encrypted, file-backed Path ORAM block store.
//!
//! A [`PathOram`] handle exposes a fixed number of fixed-size logical blocks.
//! Blocks are stored in a `k`-ary tree of encrypted buckets on disk, and every
//! read or write touches one full root-to-leaf path and remaps the accessed
//! block to a fresh random leaf, so the physical access sequence is
//! independent of which logical block was accessed.
//!
//! The stash and position map are client state. [`PathOram::close`] hands them
//! back to the caller as an [`OramState`], and [`PathOram::open`] checks them
//! against digests recorded in the (encrypted) storage header.
//!
//! ```no_run
//! use oram_store::{OpenOptions, PathOram, SetupOptions};
//!
//! # fn main() -> Result<(), oram_store::OramError> {
//! let mut oram = PathOram::setup("blocks.oram", 64, 1024, SetupOptions::default())?;
//! oram.write_block(7, &[1u8; 64])?;
//! let key = oram.key().to_vec();
//! let state = oram.close()?;
//!
//! let mut oram = PathOram::open("blocks.oram", state, &key, OpenOptions::default())?;
//! assert_eq!(oram.read_block(7)?, vec![1u8; 64]);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

use std::num::TryFromIntError;
use std::path::PathBuf;
use thiserror::Error;

pub mod block_storage;
pub mod bucket;
pub mod cipher;
pub mod encrypted_heap_storage;
pub mod integrity;
mod path;
pub mod path_oram;
pub mod position_map;
pub mod stash;
pub mod virtual_heap;

#[cfg(test)]
mod test_utils;

/// Numeric type used to identify a logical block.
pub type BlockId = u64;
/// Numeric type used to identify a leaf of the storage tree, counting from 0 at the leftmost leaf.
pub type LeafIndex = u64;
/// Numeric type used to identify a bucket of the storage tree in heap order (the root is 0).
pub type BucketIndex = u64;
/// Numeric type used to represent tree levels and heights. The root is at level 0.
pub type TreeHeight = u64;
/// Numeric type used to represent the branching factor of the storage tree.
pub type HeapBase = u64;
/// Numeric type used to represent the size of a block payload in bytes.
pub type BlockSize = usize;
/// Numeric type used to represent the number of blocks in a bucket.
pub type BucketSize = usize;

pub use block_storage::StorageType;
pub use cipher::CipherMode;
pub use integrity::OramState;
pub use path_oram::{OpenOptions, PathOram, SetupOptions};
pub use position_map::PositionMap;
pub use stash::Stash;
pub use virtual_heap::VirtualHeap;

/// Errors returned by the block store.
#[derive(Error, Debug)]
pub enum OramError {
    /// The requested tree geometry, key or cipher parameters are unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfigurationError(String),
    /// Storage already exists at the given path and overwriting was not requested.
    #[error("Storage already exists at {}", .0.display())]
    AlreadyExistsError(PathBuf),
    /// Another handle holds the storage open.
    #[error("Storage at {} is locked by another handle", .0.display())]
    StorageLockedError(PathBuf),
    /// The underlying file could not be read or written.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// The storage header could not be decrypted with the supplied key.
    #[error("The supplied key does not decrypt the storage header")]
    BadKeyError,
    /// The storage header is malformed or inconsistent with the file.
    #[error("Malformed storage: {0}")]
    FormatError(String),
    /// A bucket failed authentication or does not match the configured geometry.
    #[error("Corrupt bucket: {0}")]
    CorruptBucketError(String),
    /// A block is missing from both its path and the stash. The store cannot be used further.
    #[error("ORAM invariant violated: {0}")]
    CorruptOramError(String),
    /// The block identifier is not less than the block count.
    #[error("Block {block_id} is out of bounds for a store of {block_count} blocks")]
    AddressOutOfBoundsError {
        /// The requested block.
        block_id: BlockId,
        /// The number of blocks in the store.
        block_count: u64,
    },
    /// An argument has the wrong length or is otherwise unusable.
    #[error("Invalid argument: {0}")]
    InvalidArgumentError(String),
    /// A client state snapshot contains out-of-range entries.
    #[error("Invalid client state: {0}")]
    InvalidStateError(String),
    /// A client state snapshot does not match the digest recorded at the last close.
    #[error("The supplied {0} does not match the digest recorded in storage")]
    DigestMismatchError(&'static str),
    /// A numeric conversion failed.
    #[error("Numeric conversion failed")]
    IntegerConversionError(#[from] TryFromIntError),
    /// Client state could not be serialized or deserialized.
    #[error("Serialization failed: {0}")]
    SerializationError(#[from] bincode::Error),
}
