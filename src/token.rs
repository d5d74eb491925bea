//! Process identity tokens
//!
//! A token is a self-signed assertion a process builds for itself at start:
//! - the process id and its own public key
//! - the parent's public key (absent only for the root)
//! - the script it runs and the issuance time
//! - an Ed25519 signature over the canonical payload, made with its own key
//!
//! No server issues tokens. A token is well-formed iff its signature verifies
//! against its embedded public key; whether that key descends from the genesis
//! authority is the lineage verifier's job.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::{hex_bytes, PublicKey, TokenSigner};

/// Payload encoding version (first byte of every signed payload).
const PAYLOAD_VERSION: u8 = 1;

/// Logical process identifier, minted by the parent before spawn.
///
/// Children are named `<parent>.<seq>`, which keeps ids unique per parent and
/// usable as key derivation context before any OS pid exists.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of this process's `seq`-th child.
    pub fn child(&self, seq: u64) -> ProcessId {
        ProcessId(format!("{}.{}", self.0, seq))
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessId({})", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("token JSON is malformed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token signature does not verify for process {0}")]
    SignatureInvalid(ProcessId),
}

/// Raw Ed25519 signature, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSignature(#[serde(with = "hex_bytes")] [u8; 64]);

impl TokenSignature {
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for TokenSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenSignature({})", hex::encode(self.0))
    }
}

/// The bytes that get signed.
///
/// Field order is part of the format: postcard encodes structs positionally.
#[derive(Serialize)]
struct SigningPayload<'a> {
    version: u8,
    process_id: &'a str,
    public_key: &'a [u8; 32],
    parent_public_key: Option<&'a [u8; 32]>,
    script_path: &'a str,
    issued_at: String,
}

/// A self-signed process identity token.
///
/// Immutable once built; its public fields are copied into the provenance
/// entry on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessToken {
    process_id: ProcessId,
    public_key: PublicKey,
    parent_public_key: Option<PublicKey>,
    script_path: String,
    issued_at: DateTime<Utc>,
    signature: TokenSignature,
}

impl ProcessToken {
    /// Build and sign a token.
    ///
    /// `signer` must hold the private half of the key the token asserts;
    /// the signer's public key becomes the token's public key.
    pub fn issue(
        signer: &dyn TokenSigner,
        process_id: ProcessId,
        parent_public_key: Option<PublicKey>,
        script_path: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Result<Self, TokenError> {
        let mut token = Self {
            process_id,
            public_key: signer.public_key(),
            parent_public_key,
            script_path: script_path.into(),
            issued_at,
            signature: TokenSignature([0u8; 64]),
        };
        let payload = token.signing_payload()?;
        token.signature = TokenSignature(signer.sign(&payload));
        Ok(token)
    }

    /// Canonical serialization of every field except the signature.
    pub fn signing_payload(&self) -> Result<Vec<u8>, TokenError> {
        let payload = SigningPayload {
            version: PAYLOAD_VERSION,
            process_id: self.process_id.as_str(),
            public_key: self.public_key.as_bytes(),
            parent_public_key: self.parent_public_key.as_ref().map(PublicKey::as_bytes),
            script_path: &self.script_path,
            issued_at: self.issued_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        };
        Ok(postcard::to_allocvec(&payload)?)
    }

    /// `verify(signature, public_key, payload)`.
    pub fn verify_signature(&self) -> bool {
        match self.signing_payload() {
            Ok(payload) => self.public_key.verify(&payload, self.signature.as_bytes()),
            Err(_) => false,
        }
    }

    /// Like [`verify_signature`](Self::verify_signature) but as a `Result`.
    pub fn ensure_well_formed(&self) -> Result<(), TokenError> {
        if self.verify_signature() {
            Ok(())
        } else {
            Err(TokenError::SignatureInvalid(self.process_id.clone()))
        }
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn parent_public_key(&self) -> Option<&PublicKey> {
        self.parent_public_key.as_ref()
    }

    pub fn is_root_assertion(&self) -> bool {
        self.parent_public_key.is_none()
    }

    pub fn script_path(&self) -> &str {
        &self.script_path
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn signature(&self) -> &TokenSignature {
        &self.signature
    }

    /// Single-line JSON, safe for environment variables and log lines.
    pub fn to_json(&self) -> Result<String, TokenError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, TokenError> {
        Ok(serde_json::from_str(json)?)
    }

    #[cfg(test)]
    pub(crate) fn with_corrupted_signature(&self, index: usize) -> Self {
        let mut token = self.clone();
        token.signature.0[index % 64] ^= 0xff;
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ProcessKeypair;

    fn token() -> (ProcessKeypair, ProcessToken) {
        let parent = ProcessKeypair::from_secret([1u8; 32]);
        let kp = ProcessKeypair::from_secret([2u8; 32]);
        let token = ProcessToken::issue(
            &kp,
            ProcessId::new("root.4"),
            Some(parent.public_key()),
            "/opt/agents/workers/collect.sh",
            Utc::now(),
        )
        .unwrap();
        (kp, token)
    }

    #[test]
    fn issued_token_is_well_formed() {
        let (kp, token) = token();
        assert!(token.verify_signature());
        assert_eq!(token.public_key(), &kp.public_key());
        assert!(!token.is_root_assertion());
    }

    #[test]
    fn json_roundtrip_still_verifies() {
        let (_, token) = token();
        let json = token.to_json().unwrap();
        assert!(!json.contains('\n'));
        let back = ProcessToken::from_json(&json).unwrap();
        assert_eq!(back, token);
        assert!(back.verify_signature());
    }

    #[test]
    fn corrupted_signature_fails() {
        let (_, token) = token();
        for i in [0, 31, 63] {
            assert!(!token.with_corrupted_signature(i).verify_signature());
        }
    }

    #[test]
    fn edited_field_fails() {
        let (_, token) = token();
        let mut forged = token.clone();
        forged.script_path = "/opt/agents/validators/approve.sh".into();
        assert!(!forged.verify_signature());

        let mut reparented = token;
        reparented.parent_public_key = None;
        assert!(matches!(
            reparented.ensure_well_formed(),
            Err(TokenError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn child_ids_are_hierarchical() {
        let root = ProcessId::new("root");
        assert_eq!(root.child(3).child(1).as_str(), "root.3.1");
    }
}
