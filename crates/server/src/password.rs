//! Salted password hashes for session passwords and opwords.
//!
//! Format: `s+sha256;<salt hex>;<digest hex>` where the digest is
//! SHA-256 over salt followed by the UTF-8 password.

use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const SCHEME: &str = "s+sha256";
const SALT_LEN: usize = 16;

fn digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Hash a password. An empty password yields `None` (no password).
pub fn hash(password: &str) -> Option<String> {
    if password.is_empty() {
        return None;
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    Some(format!(
        "{SCHEME};{};{}",
        hex::encode(salt),
        hex::encode(digest(&salt, password))
    ))
}

/// Check a password against a stored hash. Nothing matches a missing or
/// malformed hash.
pub fn check(password: &str, hash: Option<&str>) -> bool {
    let Some(hash) = hash else {
        return false;
    };

    let mut parts = hash.split(';');
    let (Some(SCHEME), Some(salt), Some(expected), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    match (hex::decode(salt), hex::decode(expected)) {
        (Ok(salt), Ok(expected)) => digest(&salt, password).ct_eq(&expected).into(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_check() {
        let h = hash("hunter2").unwrap();
        assert!(h.starts_with("s+sha256;"));
        assert!(check("hunter2", Some(&h)));
        assert!(!check("hunter3", Some(&h)));
    }

    #[test]
    fn test_salt_differs() {
        assert_ne!(hash("same"), hash("same"));
    }

    #[test]
    fn test_empty_password_clears() {
        assert_eq!(hash(""), None);
        assert!(!check("", None));
    }

    #[test]
    fn test_malformed_hash_never_matches() {
        assert!(!check("x", Some("plain")));
        assert!(!check("x", Some("md5;00;00")));
        assert!(!check("x", Some("s+sha256;zz;00")));
        assert!(!check("x", Some("s+sha256;0;00")));
    }

    /// A digest of the wrong length is rejected, not truncated.
    #[test]
    fn test_short_digest_never_matches() {
        let h = hash("hunter2").unwrap();
        let truncated = &h[..h.len() - 2];
        assert!(!check("hunter2", Some(truncated)));
    }

    /// Stored hashes are lowercase hex, as written by other servers.
    #[test]
    fn test_hash_is_lowercase_hex() {
        let h = hash("hunter2").unwrap();
        let mut parts = h.split(';').skip(1);
        let salt = parts.next().unwrap();
        let digest = parts.next().unwrap();
        assert_eq!(salt.len(), SALT_LEN * 2);
        assert_eq!(digest.len(), 64);
        assert!(
            salt.chars()
                .chain(digest.chars())
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        );
    }
}
