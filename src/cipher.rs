// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Bucket and header encryption.
//!
//! Every encryption draws a fresh IV (or nonce) from the operating system's CSPRNG and
//! prepends it to the ciphertext, so rewriting a bucket with unchanged contents produces
//! an unrelated ciphertext.

use crate::OramError;
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::{consts::U12, generic_array::GenericArray, Aead, KeyInit, Payload};
use aes_gcm::AesGcm;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::{rngs::OsRng, RngCore};
use std::str::FromStr;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes128Gcm = AesGcm<Aes128, U12>;
type Aes192Gcm = AesGcm<Aes192, U12>;
type Aes256Gcm = AesGcm<Aes256, U12>;

/// Length of the IV prepended to CTR-mode ciphertexts.
pub const CTR_IV_LEN: usize = 16;
/// Length of the nonce prepended to GCM-mode ciphertexts.
pub const GCM_NONCE_LEN: usize = 12;
/// Length of the authentication tag appended to GCM-mode ciphertexts.
pub const GCM_TAG_LEN: usize = 16;
/// The supported key sizes in bytes, selecting AES-128, AES-192 or AES-256.
pub const KEY_SIZES: [usize; 3] = [16, 24, 32];
/// The key size used when the caller does not supply a key.
pub const DEFAULT_KEY_SIZE: usize = 32;

/// The cipher mode used to encrypt buckets and the storage header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CipherMode {
    /// AES in counter mode. Confidentiality only.
    Ctr,
    /// AES-GCM. Tampering with a bucket is detected when it is next read.
    #[default]
    Gcm,
}

impl CipherMode {
    /// The number of bytes encryption adds to a plaintext.
    pub fn overhead(self) -> usize {
        match self {
            CipherMode::Ctr => CTR_IV_LEN,
            CipherMode::Gcm => GCM_NONCE_LEN + GCM_TAG_LEN,
        }
    }

    /// The ciphertext length for a plaintext of `plaintext_len` bytes.
    pub fn ciphertext_len(self, plaintext_len: usize) -> usize {
        plaintext_len + self.overhead()
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            CipherMode::Ctr => 1,
            CipherMode::Gcm => 2,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Result<Self, OramError> {
        match byte {
            1 => Ok(CipherMode::Ctr),
            2 => Ok(CipherMode::Gcm),
            _ => Err(OramError::FormatError(format!(
                "unknown cipher mode {byte}"
            ))),
        }
    }
}

impl FromStr for CipherMode {
    type Err = OramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ctr" | "aes-ctr" => Ok(CipherMode::Ctr),
            "gcm" | "aes-gcm" => Ok(CipherMode::Gcm),
            _ => Err(OramError::InvalidConfigurationError(format!(
                "unknown cipher mode {s:?}"
            ))),
        }
    }
}

impl std::fmt::Display for CipherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherMode::Ctr => write!(f, "aes-ctr"),
            CipherMode::Gcm => write!(f, "aes-gcm"),
        }
    }
}

/// Returns a fresh random key of `key_size` bytes.
///
/// # Errors
///
/// Returns an `InvalidConfigurationError` if `key_size` is not one of [`KEY_SIZES`].
pub fn generate_key(key_size: usize) -> Result<Vec<u8>, OramError> {
    check_key_size(key_size)?;
    let mut key = vec![0u8; key_size];
    OsRng.fill_bytes(&mut key);
    Ok(key)
}

fn check_key_size(key_size: usize) -> Result<(), OramError> {
    if KEY_SIZES.contains(&key_size) {
        Ok(())
    } else {
        Err(OramError::InvalidConfigurationError(format!(
            "key size must be one of {KEY_SIZES:?} bytes, got {key_size}"
        )))
    }
}

/// Decryption failed: the ciphertext is malformed or was not produced under this key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthenticationFailure;

/// A key together with the mode it is used in.
#[derive(Clone)]
pub struct BucketCipher {
    mode: CipherMode,
    key: Vec<u8>,
}

impl std::fmt::Debug for BucketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketCipher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl BucketCipher {
    /// Returns a cipher using `key` in `mode`.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if the key length is not one of [`KEY_SIZES`].
    pub fn new(mode: CipherMode, key: &[u8]) -> Result<Self, OramError> {
        check_key_size(key.len())?;
        Ok(Self {
            mode,
            key: key.to_vec(),
        })
    }

    /// The cipher mode.
    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// The raw key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Encrypts `plaintext` under a fresh IV. In GCM mode, `associated_data` is authenticated too.
    pub fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, OramError> {
        match self.mode {
            CipherMode::Ctr => {
                let mut result = vec![0u8; CTR_IV_LEN];
                OsRng.fill_bytes(&mut result);
                result.extend_from_slice(plaintext);
                let (iv, body) = result.split_at_mut(CTR_IV_LEN);
                self.apply_ctr_keystream(iv, body)?;
                Ok(result)
            }
            CipherMode::Gcm => {
                let mut nonce = [0u8; GCM_NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);
                let payload = Payload {
                    msg: plaintext,
                    aad: associated_data,
                };
                let sealed = match self.key.len() {
                    16 => gcm_seal::<Aes128Gcm>(&self.key, &nonce, payload),
                    24 => gcm_seal::<Aes192Gcm>(&self.key, &nonce, payload),
                    _ => gcm_seal::<Aes256Gcm>(&self.key, &nonce, payload),
                }?;
                let mut result = Vec::with_capacity(GCM_NONCE_LEN + sealed.len());
                result.extend_from_slice(&nonce);
                result.extend_from_slice(&sealed);
                Ok(result)
            }
        }
    }

    /// Decrypts a ciphertext produced by [`BucketCipher::encrypt`] with the same associated data.
    ///
    /// CTR mode cannot detect tampering or a wrong key and only fails on a truncated ciphertext.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, AuthenticationFailure> {
        if ciphertext.len() < self.mode.overhead() {
            return Err(AuthenticationFailure);
        }
        match self.mode {
            CipherMode::Ctr => {
                let (iv, body) = ciphertext.split_at(CTR_IV_LEN);
                let mut plaintext = body.to_vec();
                self.apply_ctr_keystream(iv, &mut plaintext)
                    .map_err(|_| AuthenticationFailure)?;
                Ok(plaintext)
            }
            CipherMode::Gcm => {
                let (nonce, sealed) = ciphertext.split_at(GCM_NONCE_LEN);
                let payload = Payload {
                    msg: sealed,
                    aad: associated_data,
                };
                match self.key.len() {
                    16 => gcm_open::<Aes128Gcm>(&self.key, nonce, payload),
                    24 => gcm_open::<Aes192Gcm>(&self.key, nonce, payload),
                    _ => gcm_open::<Aes256Gcm>(&self.key, nonce, payload),
                }
            }
        }
    }

    fn apply_ctr_keystream(&self, iv: &[u8], data: &mut [u8]) -> Result<(), OramError> {
        let invalid = |_| OramError::InvalidConfigurationError("invalid key or IV length".into());
        match self.key.len() {
            16 => Aes128Ctr::new_from_slices(&self.key, iv)
                .map_err(invalid)?
                .apply_keystream(data),
            24 => Aes192Ctr::new_from_slices(&self.key, iv)
                .map_err(invalid)?
                .apply_keystream(data),
            _ => Aes256Ctr::new_from_slices(&self.key, iv)
                .map_err(invalid)?
                .apply_keystream(data),
        }
        Ok(())
    }
}

fn gcm_seal<C: Aead + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    payload: Payload<'_, '_>,
) -> Result<Vec<u8>, OramError> {
    let cipher = C::new_from_slice(key)
        .map_err(|_| OramError::InvalidConfigurationError("invalid key length".into()))?;
    cipher
        .encrypt(GenericArray::from_slice(nonce), payload)
        .map_err(|_| OramError::InvalidArgumentError("plaintext too long for AES-GCM".into()))
}

fn gcm_open<C: Aead + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    payload: Payload<'_, '_>,
) -> Result<Vec<u8>, AuthenticationFailure> {
    let cipher = C::new_from_slice(key).map_err(|_| AuthenticationFailure)?;
    cipher
        .decrypt(GenericArray::from_slice(nonce), payload)
        .map_err(|_| AuthenticationFailure)
}
