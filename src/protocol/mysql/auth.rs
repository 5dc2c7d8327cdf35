//! Challenge-response password scrambling
//!
//! The proxy uses these in both directions: to verify the fake identity
//! presented by clients, and to answer the backend's challenge with the
//! real credential.
//!
//! References:
//! - Native: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_authentication_methods_native_password_authentication.html>
//! - Caching SHA2: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_caching_sha2_authentication_exchanges.html>

use rand::Rng;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};

use super::packets::{AUTH_CACHING_SHA2_PASSWORD, AUTH_NATIVE_PASSWORD};

/// Generate a random 20-byte challenge.
///
/// 0x00 and 0xFF never appear: the greeting NUL-terminates the challenge.
pub fn generate_scramble() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut scramble = [0u8; 20];
    for byte in scramble.iter_mut() {
        *byte = rng.gen_range(1..=0xFE);
    }
    scramble
}

/// mysql_native_password response:
///
/// ```text
/// SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
/// ```
///
/// An empty password yields an empty response.
pub fn compute_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    Sha1Digest::update(&mut hasher, scramble);
    Sha1Digest::update(&mut hasher, stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Server-side check of a mysql_native_password response against the
/// plaintext password the proxy holds for that user.
pub fn check_native_password(auth_response: &[u8], scramble: &[u8], password: &str) -> bool {
    let expected = compute_auth_response(password, scramble);
    if expected.len() != auth_response.len() {
        return false;
    }
    // fold instead of == so the comparison time does not depend on the prefix
    expected
        .iter()
        .zip(auth_response)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// caching_sha2_password fast-path response:
///
/// ```text
/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) || scramble)
/// ```
pub fn compute_caching_sha2_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    Sha2Digest::update(&mut hasher, stage2);
    Sha2Digest::update(&mut hasher, scramble);
    let scramble_hash = hasher.finalize();

    stage1
        .iter()
        .zip(scramble_hash.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Auth response for the plugin the backend asked for. Unknown plugins fall
/// back to mysql_native_password, which is what servers offer on switch.
pub fn compute_auth_for_plugin(plugin_name: &str, password: &str, scramble: &[u8]) -> Vec<u8> {
    match plugin_name {
        AUTH_NATIVE_PASSWORD => compute_auth_response(password, scramble),
        AUTH_CACHING_SHA2_PASSWORD => compute_caching_sha2_response(password, scramble),
        unknown => {
            warn!(
                plugin = unknown,
                "Unknown auth plugin, falling back to mysql_native_password"
            );
            compute_auth_response(password, scramble)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_scramble() {
        let scramble = generate_scramble();
        assert!(!scramble.contains(&0));
        assert!(!scramble.contains(&0xFF));
        assert_ne!(scramble, generate_scramble());
    }

    #[test]
    fn test_compute_auth_response_empty_password() {
        assert!(compute_auth_response("", &[0u8; 20]).is_empty());
    }

    #[test]
    fn test_native_password_accepts_matching_response() {
        let scramble = generate_scramble();
        let response = compute_auth_response("secret", &scramble);
        assert_eq!(response.len(), 20);
        assert!(check_native_password(&response, &scramble, "secret"));
    }

    #[test]
    fn test_native_password_rejects_mismatch() {
        let scramble = generate_scramble();
        let response = compute_auth_response("secret", &scramble);
        assert!(!check_native_password(&response, &scramble, "Secret"));
        assert!(!check_native_password(&response[..19], &scramble, "secret"));
        assert!(!check_native_password(&[], &scramble, "secret"));

        let other_scramble = generate_scramble();
        assert!(!check_native_password(&response, &other_scramble, "secret"));
    }

    #[test]
    fn test_empty_password_matches_empty_response() {
        assert!(check_native_password(&[], &[1u8; 20], ""));
    }

    #[test]
    fn test_caching_sha2_response_length() {
        let scramble = generate_scramble();
        assert_eq!(compute_caching_sha2_response("password", &scramble).len(), 32);
        assert!(compute_caching_sha2_response("", &scramble).is_empty());
    }

    #[test]
    fn test_dispatch_by_plugin() {
        let scramble = generate_scramble();
        assert_eq!(
            compute_auth_for_plugin(AUTH_NATIVE_PASSWORD, "pass", &scramble),
            compute_auth_response("pass", &scramble)
        );
        assert_eq!(
            compute_auth_for_plugin(AUTH_CACHING_SHA2_PASSWORD, "pass", &scramble),
            compute_caching_sha2_response("pass", &scramble)
        );
        assert_eq!(
            compute_auth_for_plugin("unknown_plugin", "pass", &scramble),
            compute_auth_response("pass", &scramble)
        );
    }
}
