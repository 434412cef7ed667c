// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

//! This library provides the secret primitives for the tokengate project:
//! content hashing, the reversible obfuscation stored in the token ledger,
//! and the deterministic anagram action.
//!
//! The obfuscation is round-trip stable for a given secret, which is what
//! the ledger needs; it is not authenticated encryption.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("bad base64: {0}")]
    BadBase64(#[from] base64::DecodeError),

    #[error("bad utf-8: {0}")]
    BadUtf8(#[from] std::string::FromUtf8Error),
}

/// Fixed 256-bit content hash, hex encoded.
pub fn hash_text(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

fn xor_keystream(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(key.iter().cycle())
        .map(|(byte, key_byte)| byte ^ key_byte)
        .collect()
}

/// XOR the plain text against a keystream derived from the secret, then
/// encode the result as URL-safe base64.
pub fn obfuscate(plain: &str, secret: &str) -> String {
    let key = Sha256::digest(secret.as_bytes());
    URL_SAFE.encode(xor_keystream(plain.as_bytes(), &key))
}

/// Inverse of [obfuscate].
pub fn deobfuscate(cipher: &str, secret: &str) -> Result<String, CipherError> {
    let raw = URL_SAFE.decode(cipher.as_bytes())?;
    let key = Sha256::digest(secret.as_bytes());
    Ok(String::from_utf8(xor_keystream(&raw, &key))?)
}

/// Emit a permutation of the value's codepoints. The shuffle is seeded by
/// the value and the secret so a given pair always produces the same output.
pub fn anagram(value: &str, secret: &str) -> String {
    let seed = Sha256::digest(format!("{}{}", value, secret).as_bytes());
    let mut rng = ChaCha8Rng::from_seed(seed.into());
    let mut chars: Vec<char> = value.chars().collect();
    chars.shuffle(&mut rng);
    chars.into_iter().collect()
}
