//! Webhook signing primitives
//!
//! HMAC-SHA256 over the exact raw request body, hex-encoded the way
//! identity providers send it. Verification is constant time.

use ring::hmac;

/// Compute the lowercase hex HMAC-SHA256 of `message` under `secret`
pub fn sign_hex(secret: &[u8], message: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hex::encode(hmac::sign(&key, message).as_ref())
}

/// Check a hex-encoded HMAC-SHA256 tag in constant time
///
/// Malformed hex is treated as a mismatch.
pub fn verify_hex(secret: &[u8], message: &[u8], tag_hex: &str) -> bool {
    let tag = match hex::decode(tag_hex.trim()) {
        Ok(tag) => tag,
        Err(_) => return false,
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, message, &tag).is_ok()
}
