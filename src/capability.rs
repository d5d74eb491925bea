//! Capability call envelope
//!
//! Every call to a capability-gated collaborator carries the caller's token
//! and its ancestor tokens, so the collaborator can re-verify lineage on its
//! own. What the caller may actually do is the collaborator's business.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::revocation::RevocationList;
use crate::keys::PublicKey;
use crate::lineage::{verify_lineage, LineageError};
use crate::token::ProcessToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error(transparent)]
    Lineage(#[from] LineageError),

    #[error("caller lineage contains revoked key {0}")]
    Revoked(PublicKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityCall<T> {
    pub token: ProcessToken,
    /// Ancestor tokens, nearest parent first, as returned by the audit query.
    pub lineage: Vec<ProcessToken>,
    pub payload: T,
}

impl<T> CapabilityCall<T> {
    pub fn new(token: ProcessToken, lineage: Vec<ProcessToken>, payload: T) -> Self {
        Self {
            token,
            lineage,
            payload,
        }
    }

    /// Re-verify the caller's lineage against `genesis`, optionally refusing
    /// revoked keys.
    pub fn verify(
        &self,
        genesis: &PublicKey,
        revocations: Option<&RevocationList>,
    ) -> Result<&T, CapabilityError> {
        verify_lineage(&self.token, &self.lineage, genesis)?;
        if let Some(list) = revocations {
            if let Some(key) = list.first_revoked(std::iter::once(&self.token).chain(&self.lineage)) {
                return Err(CapabilityError::Revoked(key));
            }
        }
        Ok(&self.payload)
    }
}
