//! Key derivation engine
//!
//! Every process below the genesis authority holds an Ed25519 keypair that
//! its parent derived for it before spawning:
//!
//! ```text
//! okm   = HKDF-SHA256(salt = DERIVATION_SALT, ikm = parent_secret, info = "child:" || pid)
//! child = Ed25519 SigningKey::from_bytes(okm[0..32])
//! ```
//!
//! The child identifier is derivation context, not a secret. Identical inputs
//! always give the identical keypair; the parent secret cannot be recovered
//! from any number of derived children (HKDF is one-way).
//!
//! The keypair is held in memory only. It is never persisted, and its secret
//! half is zeroized when the holder is dropped.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::ProcessId;

/// Domain separation salt for child derivation.
const DERIVATION_SALT: &[u8] = b"proclineage/derive/v1";

/// Ed25519 secret and public key length.
pub const KEY_LEN: usize = 32;

/// Errors raised while handling raw key material.
///
/// Variants never carry key bytes, so messages are safe to log.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key length: expected {expected}, found {found}")]
    InvalidLength { expected: usize, found: usize },

    #[error("key material is not valid hex")]
    Hex,

    #[error("bytes are not a valid Ed25519 public key")]
    InvalidPublicKey,

    #[error("public key does not match secret key")]
    Mismatch,

    #[error("HKDF expansion failed")]
    Derivation,
}

/// An Ed25519 public key as carried in tokens and revocation lists.
///
/// Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex_bytes")] [u8; KEY_LEN]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim()).map_err(|_| KeyError::Hex)?;
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| KeyError::InvalidLength {
            expected: KEY_LEN,
            found: b.len(),
        })?;
        Ok(Self(arr))
    }

    /// Decode into a dalek verifying key (fails on non-canonical points).
    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| KeyError::InvalidPublicKey)
    }

    /// Strict Ed25519 verification. Any decode failure counts as `false`.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let Ok(vk) = self.verifying_key() else {
            return false;
        };
        let sig = Signature::from_bytes(signature);
        vk.verify_strict(message, &sig).is_ok()
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(vk: VerifyingKey) -> Self {
        Self(vk.to_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// Anything that can sign a token payload on behalf of a single public key.
///
/// Implemented by [`ProcessKeypair`] and by the genesis custody, whose secret
/// never enters this process.
pub trait TokenSigner {
    fn public_key(&self) -> PublicKey;
    fn sign(&self, message: &[u8]) -> [u8; 64];
}

/// Per-process Ed25519 keypair, zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct ProcessKeypair {
    #[zeroize(skip)] // ed25519_dalek::SigningKey zeroizes itself on drop
    inner: SigningKey,
}

impl ProcessKeypair {
    /// Build a keypair from a raw 32-byte secret. The input is wiped.
    pub fn from_secret(mut secret: [u8; KEY_LEN]) -> Self {
        let inner = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Self { inner }
    }

    /// Rebuild a keypair from its hex handoff form and check it against the
    /// announced public key.
    pub fn from_hex_pair(secret_hex: &str, public_hex: &str) -> Result<Self, KeyError> {
        let decoded = Zeroizing::new(hex::decode(secret_hex.trim()).map_err(|_| KeyError::Hex)?);
        if decoded.len() != KEY_LEN {
            return Err(KeyError::InvalidLength {
                expected: KEY_LEN,
                found: decoded.len(),
            });
        }
        let mut secret = [0u8; KEY_LEN];
        secret.copy_from_slice(&decoded);
        let keypair = Self::from_secret(secret);

        let announced = PublicKey::from_hex(public_hex)?;
        if keypair.public_key() != announced {
            return Err(KeyError::Mismatch);
        }
        Ok(keypair)
    }

    /// Hex form of the secret for the launch environment only.
    pub fn secret_hex(&self) -> Zeroizing<String> {
        let secret = Zeroizing::new(self.inner.to_bytes());
        Zeroizing::new(hex::encode(secret.as_slice()))
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.verifying_key().into()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.inner.sign(message).to_bytes()
    }

    /// Derive the keypair for a child that will run as `child`.
    pub fn derive_child(&self, child: &ProcessId) -> Result<ProcessKeypair, KeyError> {
        let secret = Zeroizing::new(self.inner.to_bytes());
        derive_child_keypair(&secret, child)
    }
}

impl TokenSigner for ProcessKeypair {
    fn public_key(&self) -> PublicKey {
        ProcessKeypair::public_key(self)
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        ProcessKeypair::sign(self, message)
    }
}

impl fmt::Debug for ProcessKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessKeypair")
            .field("public_key", &self.public_key())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Deterministically derive a child keypair from a parent secret.
pub fn derive_child_keypair(
    parent_secret: &[u8; KEY_LEN],
    child: &ProcessId,
) -> Result<ProcessKeypair, KeyError> {
    let hk = Hkdf::<Sha256>::new(Some(DERIVATION_SALT), parent_secret);

    let mut info = Vec::with_capacity(6 + child.as_str().len());
    info.extend_from_slice(b"child:");
    info.extend_from_slice(child.as_str().as_bytes());

    let mut okm = [0u8; KEY_LEN];
    hk.expand(&info, &mut okm).map_err(|_| KeyError::Derivation)?;
    Ok(ProcessKeypair::from_secret(okm))
}

/// Hex serde for fixed-size byte arrays.
pub(crate) mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| D::Error::invalid_length(b.len(), &"fixed-size hex byte string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parent() -> ProcessKeypair {
        ProcessKeypair::from_secret([7u8; KEY_LEN])
    }

    #[test]
    fn derivation_is_deterministic() {
        let pid = ProcessId::new("root.1");
        let a = parent().derive_child(&pid).unwrap();
        let b = parent().derive_child(&pid).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(*a.secret_hex(), *b.secret_hex());
    }

    #[test]
    fn distinct_children_get_distinct_keys() {
        let a = parent().derive_child(&ProcessId::new("root.1")).unwrap();
        let b = parent().derive_child(&ProcessId::new("root.2")).unwrap();
        assert_ne!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), parent().public_key());
    }

    #[test]
    fn hex_pair_roundtrip_and_mismatch() {
        let kp = parent().derive_child(&ProcessId::new("root.3")).unwrap();
        let back = ProcessKeypair::from_hex_pair(&kp.secret_hex(), &kp.public_key().to_hex()).unwrap();
        assert_eq!(back.public_key(), kp.public_key());

        let other = parent().public_key().to_hex();
        assert_eq!(
            ProcessKeypair::from_hex_pair(&kp.secret_hex(), &other).unwrap_err(),
            KeyError::Mismatch
        );
        assert_eq!(
            ProcessKeypair::from_hex_pair("abcd", &other).unwrap_err(),
            KeyError::InvalidLength { expected: 32, found: 2 }
        );
    }

    #[test]
    fn debug_redacts_secret() {
        let kp = parent();
        let shown = format!("{kp:?}");
        assert!(shown.contains("<redacted>"));
        assert!(!shown.contains(kp.secret_hex().as_str()));
    }

    #[test]
    fn public_key_hex_serde() {
        let pk = parent().public_key();
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", pk.to_hex()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
    }

    proptest! {
        #[test]
        fn prop_derivation_repeatable_and_separating(
            seed in any::<[u8; 32]>(),
            a in "[a-z0-9.]{1,24}",
            b in "[a-z0-9.]{1,24}",
        ) {
            let first = derive_child_keypair(&seed, &ProcessId::new(a.clone())).unwrap();
            let again = derive_child_keypair(&seed, &ProcessId::new(a.clone())).unwrap();
            prop_assert_eq!(first.public_key(), again.public_key());

            let other = derive_child_keypair(&seed, &ProcessId::new(b.clone())).unwrap();
            if a != b {
                prop_assert_ne!(first.public_key(), other.public_key());
            }
        }

        #[test]
        fn prop_sign_verify_and_bit_flips(
            seed in any::<[u8; 32]>(),
            message in prop::collection::vec(any::<u8>(), 1..128),
            flip in any::<usize>(),
        ) {
            let kp = ProcessKeypair::from_secret(seed);
            let pk = kp.public_key();
            let sig = kp.sign(&message);
            prop_assert!(pk.verify(&message, &sig));

            let mut bad_sig = sig;
            let bit = flip % (64 * 8);
            bad_sig[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(!pk.verify(&message, &bad_sig));

            let mut bad_msg = message.clone();
            let bit = flip % (bad_msg.len() * 8);
            bad_msg[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(!pk.verify(&bad_msg, &sig));
        }
    }
}
