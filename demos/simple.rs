// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A very simple demonstration of the use of the block store.

extern crate oram_store;

use oram_store::{OpenOptions, OramError, PathOram, SetupOptions};

fn main() -> Result<(), OramError> {
    let dir = std::env::temp_dir().join(format!("oram-store-simple-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("blocks.oram");

    let mut oram = PathOram::setup(&path, 64, 64, SetupOptions::default())?;
    oram.write_block(0, &[1u8; 64])?;
    let key = oram.key().to_vec();
    let state = oram.close()?;

    let mut oram = PathOram::open(&path, state, &key, OpenOptions::default())?;
    println!("{:?}", &oram.read_block(0)?[..8]);
    oram.close()?;

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
