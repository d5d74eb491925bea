//! Registration rejection taxonomy.
//!
//! Every variant is terminal for the registering process: a rejected process
//! must exit rather than run unauthenticated.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Role;
use crate::journal::JournalError;
use crate::keys::PublicKey;
use crate::lineage::LineageError;
use crate::token::ProcessId;

/// Wire-level reason code returned in a rejected registration response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    SignatureInvalid,
    LineageBroken,
    RevokedKey,
    ScriptNotAllowlisted,
    PolicyViolation,
    DuplicateRegistration,
    LimitExceeded,
    /// The rejection could not be recorded; the request is refused regardless.
    AuditFailure,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("signature of {0} does not verify")]
    SignatureInvalid(ProcessId),

    #[error("lineage of {process_id} is broken: {detail}")]
    LineageBroken { process_id: ProcessId, detail: String },

    #[error("key {key} in the presented lineage is revoked")]
    RevokedKey { key: PublicKey },

    #[error("script {script} is not allow-listed")]
    ScriptNotAllowlisted { script: String },

    #[error("a {parent} may not spawn a {child}")]
    PolicyViolation { parent: Role, child: Role },

    #[error("process {0} is already registered")]
    DuplicateRegistration(ProcessId),

    #[error("resource limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("audit journal write failed: {0}")]
    Audit(#[from] JournalError),
}

impl RegistrationError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            RegistrationError::SignatureInvalid(_) => ReasonCode::SignatureInvalid,
            RegistrationError::LineageBroken { .. } => ReasonCode::LineageBroken,
            RegistrationError::RevokedKey { .. } => ReasonCode::RevokedKey,
            RegistrationError::ScriptNotAllowlisted { .. } => ReasonCode::ScriptNotAllowlisted,
            RegistrationError::PolicyViolation { .. } => ReasonCode::PolicyViolation,
            RegistrationError::DuplicateRegistration(_) => ReasonCode::DuplicateRegistration,
            RegistrationError::LimitExceeded(_) => ReasonCode::LimitExceeded,
            RegistrationError::Audit(_) => ReasonCode::AuditFailure,
        }
    }

    pub(crate) fn broken(process_id: &ProcessId, detail: impl Into<String>) -> Self {
        RegistrationError::LineageBroken {
            process_id: process_id.clone(),
            detail: detail.into(),
        }
    }
}

impl From<LineageError> for RegistrationError {
    fn from(err: LineageError) -> Self {
        match err {
            LineageError::SignatureInvalid(pid) => RegistrationError::SignatureInvalid(pid),
            LineageError::Broken { process_id, detail } => {
                RegistrationError::LineageBroken { process_id, detail }
            }
        }
    }
}
