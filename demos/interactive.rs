// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A simple interactive demonstration of the block store.
//!
//! Each block holds one `u64`. The store file and its client state are kept in the
//! working directory, so a later session picks up where the last one stopped.
//! The state file is rewritten right after setup and whenever a session ends.

use oram_store::{CipherMode, OpenOptions, OramState, PathOram, SetupOptions, StorageType};
use rustyline::history::FileHistory;
use rustyline::Editor;
use std::path::Path;

const STORE_PATH: &str = "interactive.oram";
const STATE_PATH: &str = "interactive.state";
const KEY_PATH: &str = "interactive.key";
const BLOCK_SIZE: usize = 8;

fn parse_number(
    prompt: &str,
    rl: &mut Editor<(), FileHistory>,
) -> Result<u64, Box<dyn std::error::Error>> {
    Ok(loop {
        println!("{}", prompt);
        println!();
        let readline: String = rl.readline("> ")?;
        let number_parse = readline.trim().parse::<u64>();
        match number_parse {
            Ok(number) => break number,
            Err(_) => {
                println!("Expected a number. Try again.");
                continue;
            }
        }
    })
}

fn parse_choice<T: std::str::FromStr>(
    prompt: &str,
    rl: &mut Editor<(), FileHistory>,
) -> Result<T, Box<dyn std::error::Error>> {
    Ok(loop {
        println!("{}", prompt);
        let readline: String = rl.readline("> ")?;
        match readline.trim().parse::<T>() {
            Ok(choice) => break choice,
            Err(_) => println!("Try again."),
        }
    })
}

fn open(storage_type: StorageType) -> Result<PathOram, Box<dyn std::error::Error>> {
    let state = OramState::from_bytes(&std::fs::read(STATE_PATH)?)?;
    let key = std::fs::read(KEY_PATH)?;
    let oram = PathOram::open(
        STORE_PATH,
        state,
        &key,
        OpenOptions {
            storage_type,
            ..OpenOptions::default()
        },
    )?;
    println!("Opened a store of {} integers.", oram.block_count());
    Ok(oram)
}

fn save(oram: PathOram) -> Result<(), Box<dyn std::error::Error>> {
    let state = oram.close()?;
    std::fs::write(STATE_PATH, state.to_bytes()?)?;
    Ok(())
}

fn open_or_setup(
    rl: &mut Editor<(), FileHistory>,
) -> Result<PathOram, Box<dyn std::error::Error>> {
    if Path::new(STORE_PATH).exists() {
        let storage_type = parse_choice::<StorageType>("Storage type (file or mmap)?", rl)?;
        return open(storage_type);
    }

    let block_count = parse_number("How many integers would you like to store?", rl)?;
    let cipher_mode = parse_choice::<CipherMode>("Cipher (ctr or gcm)?", rl)?;
    let storage_type = parse_choice::<StorageType>("Storage type (file or mmap)?", rl)?;
    let oram = PathOram::setup(
        STORE_PATH,
        BLOCK_SIZE,
        block_count,
        SetupOptions {
            cipher_mode,
            storage_type,
            ..SetupOptions::default()
        },
    )?;
    std::fs::write(KEY_PATH, oram.key())?;
    save(oram)?;
    open(storage_type)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut rl = Editor::<(), _>::new()?;

    let mut oram = open_or_setup(&mut rl)?;
    // Save even if the session ends on an input error, such as end of input.
    let session = run_session(&mut rl, &mut oram);
    save(oram)?;
    println!("Saved.");
    session
}

fn run_session(
    rl: &mut Editor<(), FileHistory>,
    oram: &mut PathOram,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let action = loop {
            println!("Enter an option (R, W or Q):");
            println!("R) Read");
            println!("W) Write");
            println!("Q) Save and quit");
            let action: String = rl.readline("> ")?;
            if !["R", "W", "Q"].contains(&action.trim()) {
                println!("Try again.");
                continue;
            }
            break action.trim().to_string();
        };

        if action == "Q" {
            return Ok(());
        }

        let address = parse_number("What address?", rl)?;

        if action == "R" {
            match oram.read_block(address) {
                Ok(bytes) => {
                    let mut value = [0u8; BLOCK_SIZE];
                    value.copy_from_slice(&bytes);
                    println!("Value at {} is {}.", address, u64::from_le_bytes(value));
                }
                Err(e) => println!("{}", e),
            }
        }

        if action == "W" {
            let value = parse_number("Value to write?", rl)?;
            match oram.write_block(address, &value.to_le_bytes()) {
                Ok(()) => println!("Wrote value {} to address {}.", value, address),
                Err(e) => println!("{}", e),
            }
        }
    }
}
