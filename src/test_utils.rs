// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! This module contains common test utilities for the crate's unit tests.

use crate::path_oram::{OpenOptions, PathOram, SetupOptions};
use crate::{BlockId, BlockSize, BucketIndex};
use rand::{rngs::StdRng, Rng, SeedableRng};
use simplelog::{Config, WriteLogger};
use std::collections::HashMap;
use std::sync::Once;

static INIT: Once = Once::new();

// For use in manual testing and inspection.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        WriteLogger::init(log::LevelFilter::Info, Config::default(), std::io::stdout()).unwrap()
    })
}

/// Checks the Path ORAM invariant: every block is either in the stash or in exactly one bucket,
/// and that bucket lies on the path to the block's leaf.
pub(crate) fn assert_reachability(oram: &mut PathOram) {
    let heap = *oram.heap();
    let mut locations: HashMap<BlockId, Vec<BucketIndex>> = HashMap::new();
    for index in 0..heap.bucket_count() {
        let bucket = oram.storage_mut().read_bucket(index).unwrap();
        for block in bucket.blocks().iter().filter(|block| !block.is_dummy()) {
            locations.entry(block.block_id).or_default().push(index);
        }
    }

    for block_id in 0..oram.block_count() {
        let in_stash = oram.stash().contains(block_id);
        let buckets = locations.remove(&block_id).unwrap_or_default();
        assert_eq!(
            usize::from(in_stash) + buckets.len(),
            1,
            "block {block_id} is stored {} times",
            usize::from(in_stash) + buckets.len()
        );
        let leaf = oram.position_map().get(block_id).unwrap();
        for bucket in buckets {
            assert!(
                heap.is_on_path(bucket, leaf),
                "block {block_id} is in bucket {bucket}, off the path to leaf {leaf}"
            );
        }
    }
    assert!(locations.is_empty(), "unknown blocks {:?}", locations.keys());
}

fn random_payload(rng: &mut StdRng, block_size: BlockSize) -> Vec<u8> {
    let mut result = vec![0u8; block_size];
    rng.fill(&mut result[..]);
    result
}

/// Closes `oram`, reopens it with the returned state, and checks every block against `mirror_array`.
fn reopen_and_check(oram: PathOram, path: &std::path::Path, mirror_array: &[Vec<u8>]) {
    let key = oram.key().to_vec();
    let storage_type = oram.storage_type();
    let state = oram.close().unwrap();
    let mut oram = PathOram::open(
        path,
        state,
        &key,
        OpenOptions {
            storage_type,
            ..OpenOptions::default()
        },
    )
    .unwrap();
    for (block_id, expected) in mirror_array.iter().enumerate() {
        assert_eq!(&oram.read_block(block_id as BlockId).unwrap(), expected, "{block_id}");
    }
    assert_reachability(&mut oram);
    oram.close().unwrap();
}

/// Tests the correctness of a `PathOram` on a workload of random reads and writes.
pub(crate) fn test_correctness_random_workload(
    options: SetupOptions,
    block_size: BlockSize,
    block_count: u64,
    num_operations: u32,
) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");

    let mut oram = PathOram::setup(&path, block_size, block_count, options).unwrap();
    let mut mirror_array = vec![vec![0u8; block_size]; block_count as usize];
    let mut max_stash_size = 0;

    for _ in 0..num_operations {
        let random_index = rng.gen_range(0..block_count);
        let read_versus_write = rng.gen::<bool>();

        if read_versus_write {
            assert_eq!(
                oram.read_block(random_index).unwrap(),
                mirror_array[random_index as usize]
            );
        } else {
            let payload = random_payload(&mut rng, block_size);
            oram.write_block(random_index, &payload).unwrap();
            mirror_array[random_index as usize] = payload;
        }
        max_stash_size = max_stash_size.max(oram.stash().len());
    }
    log::info!("Maximum stash size: {}", max_stash_size);

    assert_reachability(&mut oram);
    reopen_and_check(oram, &path, &mirror_array);
}

/// Tests the correctness of a `PathOram` on repeated passes of sequential accesses 0, 1, ..., `block_count`.
pub(crate) fn test_correctness_linear_workload(
    options: SetupOptions,
    block_size: BlockSize,
    block_count: u64,
    num_operations: u32,
) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");

    let mut oram = PathOram::setup(&path, block_size, block_count, options).unwrap();
    let mut mirror_array = vec![vec![0u8; block_size]; block_count as usize];

    let num_passes = u64::from(num_operations) / block_count;

    for _ in 0..num_passes {
        for index in 0..block_count {
            let read_versus_write: bool = rng.gen::<bool>();

            if read_versus_write {
                assert_eq!(
                    oram.read_block(index).unwrap(),
                    mirror_array[index as usize]
                );
            } else {
                let payload = random_payload(&mut rng, block_size);
                oram.write_block(index, &payload).unwrap();
                mirror_array[index as usize] = payload;
            }
        }
    }

    assert_reachability(&mut oram);
    reopen_and_check(oram, &path, &mirror_array);
}

macro_rules! create_correctness_test {
    ($function_name:ident, $storage_type:ident, $cipher_mode:ident, $bucket_capacity:expr, $heap_base:expr, $block_count:expr, $iterations_to_test:expr) => {
        paste::paste! {
            #[test]
            fn [<$function_name _ $storage_type:snake _ $cipher_mode:snake _ $bucket_capacity _ $heap_base _ $block_count _ $iterations_to_test>]() {
                $function_name(
                    $crate::path_oram::SetupOptions {
                        bucket_capacity: $bucket_capacity,
                        heap_base: $heap_base,
                        storage_type: $crate::block_storage::StorageType::$storage_type,
                        cipher_mode: $crate::cipher::CipherMode::$cipher_mode,
                        ..$crate::path_oram::SetupOptions::default()
                    },
                    16,
                    $block_count,
                    $iterations_to_test,
                );
            }
        }
    };
}

macro_rules! create_correctness_tests_for_workload {
    ($function_name: ident) => {
        create_correctness_test!($function_name, File, Gcm, 4, 2, 1, 10);
        create_correctness_test!($function_name, File, Gcm, 2, 2, 8, 100);
        create_correctness_test!($function_name, File, Ctr, 2, 2, 8, 100);
        create_correctness_test!($function_name, Mmap, Gcm, 2, 2, 8, 100);
        create_correctness_test!($function_name, Mmap, Ctr, 4, 2, 32, 300);
        create_correctness_test!($function_name, File, Gcm, 3, 3, 27, 300);
        create_correctness_test!($function_name, Mmap, Gcm, 2, 4, 50, 300);
        // 64 blocks in a tree of branching factor 2 and 4 blocks per bucket, testing with 1000 operations
        create_correctness_test!($function_name, File, Ctr, 4, 2, 64, 1000);
    };
}

pub(crate) use create_correctness_test;
pub(crate) use create_correctness_tests_for_workload;
