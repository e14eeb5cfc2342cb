//! Salted password digests for the account layer.
//!
//! Stored form is `<salt_hex>$<digest_hex>` where the digest is
//! HMAC-SHA256 keyed by the per-user random salt over the password bytes.
//! Verification goes through the Mac verifier's constant-time comparison.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hash a password with a fresh 16-byte random salt.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::rng().fill(&mut salt);
    let digest = compute_digest(&salt, password);
    format!("{}${}", hex::encode(salt), hex::encode(digest))
}

/// Check a password against a stored `salt$digest` string.
///
/// Any structural defect in the stored value counts as a mismatch.
pub fn verify_password(stored: &str, password: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(digest) = hex::decode(digest_hex) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(&salt).expect("HMAC can take key of any size");
    mac.update(password.as_bytes());
    mac.verify_slice(&digest).is_ok()
}

fn compute_digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC can take key of any size");
    mac.update(password.as_bytes());
    mac.finalize().into_bytes().to_vec()
}
