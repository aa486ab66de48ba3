use hmac::{Hmac, Mac};
use sha2::Sha256;

pub type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 of `message` under `secret`.
pub fn hmac_sha256(secret: &[u8], message: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Verifies `expected_tag` against HMAC-SHA256(secret, message).
///
/// `hmac` compares in constant time.
pub fn verify_hmac_sha256(secret: &[u8], message: &[u8], expected_tag: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(expected_tag).is_ok()
}

/// Constant-time equality for shared secrets of arbitrary length.
///
/// Both sides are reduced to an HMAC under a fixed key so the comparison is
/// over equal-length tags and runs through `verify_slice`.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    const KEY: &[u8] = b"payrail-secret-comparison";
    let tag = hmac_sha256(KEY, a);
    verify_hmac_sha256(KEY, b, &tag)
}
