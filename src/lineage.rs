//! Lineage verification
//!
//! Pure check that a token descends from the genesis key:
//!
//! 1. the token's own signature verifies against its embedded public key
//! 2. a token without a parent key is a root assertion, valid only if its
//!    public key is the genesis key
//! 3. otherwise the next ancestor must exist and carry exactly the public key
//!    the token names as its parent
//! 4. repeat on that ancestor
//!
//! Nothing here touches the provenance store, so the same function verifies
//! lineages rebuilt offline from logged tokens.

use thiserror::Error;

use crate::keys::PublicKey;
use crate::token::{ProcessId, ProcessToken};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LineageError {
    #[error("signature of {0} does not verify")]
    SignatureInvalid(ProcessId),

    #[error("lineage broken at {process_id}: {detail}")]
    Broken { process_id: ProcessId, detail: String },
}

impl LineageError {
    fn broken(token: &ProcessToken, detail: impl Into<String>) -> Self {
        LineageError::Broken {
            process_id: token.process_id().clone(),
            detail: detail.into(),
        }
    }
}

/// Verify `token` against its ancestors (nearest parent first) up to the
/// genesis key.
pub fn verify_lineage(
    token: &ProcessToken,
    ancestors: &[ProcessToken],
    genesis: &PublicKey,
) -> Result<(), LineageError> {
    if !token.verify_signature() {
        return Err(LineageError::SignatureInvalid(token.process_id().clone()));
    }

    let Some(parent_key) = token.parent_public_key() else {
        if token.public_key() != genesis {
            return Err(LineageError::broken(token, "root assertion is not the genesis key"));
        }
        if !ancestors.is_empty() {
            return Err(LineageError::broken(token, "ancestors listed above a root assertion"));
        }
        return Ok(());
    };

    let Some((parent, rest)) = ancestors.split_first() else {
        return Err(LineageError::broken(token, "missing parent token"));
    };
    if parent.public_key() != parent_key {
        return Err(LineageError::broken(
            token,
            format!("parent key mismatch: expected {parent_key}, got {}", parent.public_key()),
        ));
    }

    verify_lineage(parent, rest, genesis)
}

/// Verify a whole chain given leaf first, root last.
pub fn verify_chain(chain: &[ProcessToken], genesis: &PublicKey) -> Result<(), LineageError> {
    match chain.split_first() {
        Some((leaf, ancestors)) => verify_lineage(leaf, ancestors, genesis),
        None => Err(LineageError::Broken {
            process_id: ProcessId::new(""),
            detail: "empty chain".into(),
        }),
    }
}

pub fn is_valid_chain(chain: &[ProcessToken], genesis: &PublicKey) -> bool {
    verify_chain(chain, genesis).is_ok()
}
