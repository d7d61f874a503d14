//! Salted PIN hashing used to gate settings changes.

use crate::model::{PinRecord, Settings};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

const SALT_LEN: usize = 16;

/// base64(SHA-256(pin bytes || salt bytes)). `None` if the salt is not base64.
pub fn hash_pin(pin: &str, salt_b64: &str) -> Option<String> {
    let salt = BASE64.decode(salt_b64).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(pin.as_bytes());
    hasher.update(&salt);
    Some(BASE64.encode(hasher.finalize()))
}

pub fn set_pin(settings: &mut Settings, new_pin: &str) {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = BASE64.encode(salt);
    settings.pin = PinRecord {
        hash: hash_pin(new_pin, &salt),
        salt: Some(salt),
    };
}

/// False when no PIN is configured.
pub fn verify_pin(settings: &Settings, candidate: &str) -> bool {
    let (Some(hash), Some(salt)) = (&settings.pin.hash, &settings.pin.salt) else {
        return false;
    };
    hash_pin(candidate, salt).is_some_and(|h| &h == hash)
}
