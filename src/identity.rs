//! HMAC-based masking of subject ids for rate-limit identifiers.
//!
//! The remote rate-limit store needs a key that is stable for the same
//! actor and action class across calls, but it must not receive user ids or
//! emails in clear text. Identifiers are therefore
//! `"{action_class}:{hex(HMAC-SHA256(subject))}"`, keyed by material derived
//! from a configured secret.
//!
//! # Properties
//!
//! - **Determinism**: same subject + same secret always produce the same hash
//! - **Key Isolation**: different secrets produce different hashes
//! - **One-way**: the subject cannot be recovered from the identifier

use hkdf::Hkdf;
use ring::hmac;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const HKDF_SALT: &[u8] = b"rentguard-identifier-masking-v1";
const HKDF_INFO: &[u8] = b"hmac-sha256-key";

/// A 32-byte masked subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaskedIdentity([u8; 32]);

impl MaskedIdentity {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// HMAC key for identifier masking. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IdentifierKey([u8; 32]);

impl IdentifierKey {
    /// Derive the masking key from a configured secret with HKDF-SHA256.
    pub fn derive(secret: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret);
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        Self(key)
    }

    /// Derive from an owned secret string and wipe the string afterwards.
    pub fn from_secret(mut secret: String) -> Self {
        let key = Self::derive(secret.as_bytes());
        secret.zeroize();
        key
    }

    pub fn mask(&self, subject: &str) -> MaskedIdentity {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.0);
        let tag = hmac::sign(&key, subject.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(tag.as_ref());
        MaskedIdentity(out)
    }

    /// Rate-limit identifier for `subject` performing actions of `action_class`.
    pub fn identifier(&self, action_class: &str, subject: &str) -> String {
        format!("{}:{}", action_class, self.mask(subject).to_hex())
    }
}

impl std::fmt::Debug for IdentifierKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IdentifierKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_determinism() {
        let key = IdentifierKey::derive(b"test-secret");
        assert_eq!(key.mask("user-1"), key.mask("user-1"));
        assert_eq!(
            key.identifier("auth", "user-1"),
            key.identifier("auth", "user-1")
        );
    }

    #[test]
    fn test_key_isolation() {
        let key1 = IdentifierKey::derive(b"secret-one");
        let key2 = IdentifierKey::derive(b"secret-two");
        assert_ne!(key1.mask("user-1"), key2.mask("user-1"));
    }

    #[test]
    fn test_identifier_does_not_leak_subject() {
        let key = IdentifierKey::derive(b"test-secret");
        let identifier = key.identifier("payment", "renter@example.com");

        assert!(identifier.starts_with("payment:"));
        assert!(!identifier.contains("renter"));
        assert!(!identifier.contains("example.com"));
        // prefix + ':' + 64 hex chars
        assert_eq!(identifier.len(), "payment:".len() + 64);
    }

    #[test]
    fn test_action_class_separates_identifiers() {
        let key = IdentifierKey::derive(b"test-secret");
        assert_ne!(
            key.identifier("auth", "user-1"),
            key.identifier("booking", "user-1")
        );
    }

    #[test]
    fn test_from_secret_matches_derive() {
        let a = IdentifierKey::from_secret("shared".to_string());
        let b = IdentifierKey::derive(b"shared");
        assert_eq!(a.mask("x"), b.mask("x"));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = IdentifierKey::derive(b"test-secret");
        assert_eq!(format!("{:?}", key), "IdentifierKey(<redacted>)");
    }

    proptest! {
        #[test]
        fn prop_collision_resistance(
            subject1 in "[a-z0-9._%+-]+@[a-z0-9.-]+\\.[a-z]{2,}",
            subject2 in "[a-z0-9._%+-]+@[a-z0-9.-]+\\.[a-z]{2,}",
        ) {
            prop_assume!(subject1 != subject2);
            let key = IdentifierKey::derive(b"proptest-secret");
            prop_assert_ne!(key.mask(&subject1), key.mask(&subject2));
        }

        #[test]
        fn prop_identifier_is_stable(subject in ".*", secret in proptest::collection::vec(any::<u8>(), 1..64)) {
            let key = IdentifierKey::derive(&secret);
            prop_assert_eq!(key.identifier("general", &subject), key.identifier("general", &subject));
        }
    }
}
