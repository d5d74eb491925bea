//! Genesis authority and root key custody
//!
//! The genesis public key is fixed at deployment and anchors every lineage.
//! The matching private key lives in custody, typically a hardware module,
//! and is only ever reached through [`RootCustody`]: the root process can ask
//! it to sign and to derive first-level child keys, but never sees the secret.
//!
//! [`SoftwareCustody`] keeps the secret in process memory. It exists for
//! development and tests and must not back a production deployment.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use rand_core::{OsRng, RngCore};
use zeroize::{Zeroize, Zeroizing};

use crate::auth::AuthorizationPolicy;
use crate::keys::{derive_child_keypair, KeyError, ProcessKeypair, PublicKey, TokenSigner};
use crate::token::{ProcessId, ProcessToken, TokenError};

/// Immutable root of trust: public key plus the fixed policy.
#[derive(Debug, Clone)]
pub struct GenesisAuthority {
    public_key: PublicKey,
    policy: AuthorizationPolicy,
}

impl GenesisAuthority {
    pub fn new(public_key: PublicKey, policy: AuthorizationPolicy) -> Self {
        Self { public_key, policy }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn policy(&self) -> &AuthorizationPolicy {
        &self.policy
    }
}

/// Access to the genesis private key without exposing it.
pub trait RootCustody: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, message: &[u8]) -> [u8; 64];

    /// Derive the keypair of a first-level child, using the genesis secret
    /// as input keying material.
    fn derive_child(&self, child: &ProcessId) -> Result<ProcessKeypair, KeyError>;
}

/// In-memory custody for development and tests.
pub struct SoftwareCustody {
    // ed25519_dalek::SigningKey zeroizes itself on drop
    inner: SigningKey,
}

impl SoftwareCustody {
    /// Fresh genesis key from the OS RNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let inner = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self { inner }
    }

    /// Genesis key from a fixed seed (reproducible test deployments).
    pub fn from_seed(mut seed: [u8; 32]) -> Self {
        let inner = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self { inner }
    }
}

impl RootCustody for SoftwareCustody {
    fn public_key(&self) -> PublicKey {
        self.inner.verifying_key().into()
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.inner.sign(message).to_bytes()
    }

    fn derive_child(&self, child: &ProcessId) -> Result<ProcessKeypair, KeyError> {
        let secret = Zeroizing::new(self.inner.to_bytes());
        derive_child_keypair(&secret, child)
    }
}

impl std::fmt::Debug for SoftwareCustody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareCustody")
            .field("public_key", &RootCustody::public_key(self))
            .finish_non_exhaustive()
    }
}

struct CustodySigner<'a>(&'a dyn RootCustody);

impl TokenSigner for CustodySigner<'_> {
    fn public_key(&self) -> PublicKey {
        self.0.public_key()
    }

    fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.0.sign(message)
    }
}

/// The root process: its token is signed by custody and its children's keys
/// are derived by custody.
pub struct RootIdentity {
    custody: Box<dyn RootCustody>,
    token: ProcessToken,
    next_child: AtomicU64,
}

impl RootIdentity {
    /// Build the root token (no parent key, public key = genesis key).
    pub fn establish(
        custody: Box<dyn RootCustody>,
        process_id: ProcessId,
        script_path: impl Into<String>,
    ) -> Result<Self, TokenError> {
        let token = ProcessToken::issue(
            &CustodySigner(custody.as_ref()),
            process_id,
            None,
            script_path,
            Utc::now(),
        )?;
        log::info!(
            "root identity {} established with key {}",
            token.process_id(),
            token.public_key()
        );
        Ok(Self {
            custody,
            token,
            next_child: AtomicU64::new(1),
        })
    }

    pub fn token(&self) -> &ProcessToken {
        &self.token
    }

    pub(crate) fn derive_child(&self, child: &ProcessId) -> Result<ProcessKeypair, KeyError> {
        self.custody.derive_child(child)
    }

    pub(crate) fn next_child_id(&self) -> ProcessId {
        let seq = self.next_child.fetch_add(1, Ordering::SeqCst);
        self.token.process_id().child(seq)
    }
}
