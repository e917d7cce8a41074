//! Salt and password hashing (§4.4): a 64-byte random salt, SHA-512(salt‖
//! password), constant-time comparison. No teacher analog for hashing
//! itself; `sha2`/`hex` usage matches the corpus's style for this kind of
//! small crypto helper.

use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

/// Generates a fresh 64-byte random salt (GetSalt response, §4.6).
pub fn generate_salt() -> [u8; 64] {
    use rand::RngCore;
    let mut salt = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Computes SHA-512(salt‖password). The password is wrapped in
/// `Zeroizing` so it's wiped from memory as soon as this function returns,
/// even though it was passed in by value.
pub fn hash_password(salt: &[u8; 64], password: &str) -> [u8; 64] {
    let mut buf = Zeroizing::new(Vec::with_capacity(64 + password.len()));
    buf.extend_from_slice(salt);
    buf.extend_from_slice(password.as_bytes());
    let digest = Sha512::digest(&buf[..]);
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

/// Mints a random 32-byte admin-challenge token (§4.6), hex-encoded. The
/// daemon prints this once at startup; `Shutdown` over either transport
/// must echo it back, so a remote caller that never saw the log cannot
/// stop the server.
pub fn generate_admin_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time comparison of two equal-length strings, used to check the
/// admin-challenge token without leaking a timing side channel.
pub fn verify_str(expected: &str, candidate: &str) -> bool {
    let e = expected.as_bytes();
    let c = candidate.as_bytes();
    if e.len() != c.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in e.iter().zip(c.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Constant-time comparison of two hashes — must not short-circuit on the
/// first mismatching byte, or timing leaks the hash.
pub fn verify(expected: &[u8; 64], candidate: &[u8; 64]) -> bool {
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(candidate.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Checks a plaintext `password` against a configured `(salt, hash)` pair.
pub fn check_password(salt: &[u8; 64], hash: &[u8; 64], password: &str) -> bool {
    let candidate = hash_password(salt, password);
    verify(hash, &candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_password_verifies() {
        let salt = generate_salt();
        let hash = hash_password(&salt, "hunter2");
        assert!(check_password(&salt, &hash, "hunter2"));
    }

    #[test]
    fn wrong_password_is_rejected() {
        let salt = generate_salt();
        let hash = hash_password(&salt, "hunter2");
        assert!(!check_password(&salt, &hash, "hunter3"));
    }

    #[test]
    fn different_salts_produce_different_hashes_for_same_password() {
        let salt_a = generate_salt();
        let salt_b = generate_salt();
        assert_ne!(hash_password(&salt_a, "same"), hash_password(&salt_b, "same"));
    }

    #[test]
    fn verify_is_symmetric_and_reflexive() {
        let salt = generate_salt();
        let hash = hash_password(&salt, "password");
        assert!(verify(&hash, &hash));
    }

    #[test]
    fn salt_is_64_bytes_and_varies_between_calls() {
        let a = generate_salt();
        let b = generate_salt();
        assert_ne!(a, b, "extraordinarily unlikely collision would indicate a broken RNG");
    }

    #[test]
    fn admin_challenge_varies_between_calls() {
        let a = generate_admin_challenge();
        let b = generate_admin_challenge();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64, "32 bytes hex-encoded is 64 chars");
    }

    #[test]
    fn verify_str_rejects_mismatched_length_and_content() {
        assert!(verify_str("abc", "abc"));
        assert!(!verify_str("abc", "abd"));
        assert!(!verify_str("abc", "abcd"));
    }
}
