//! Environment key handoff and fail-closed bootstrap
//!
//! A parent passes a child everything it needs through the launch
//! environment, and nothing else:
//!
//! | Variable | Content |
//! |----------|---------|
//! | `PROCLINEAGE_PROCESS_ID` | the child's process id |
//! | `PROCLINEAGE_SCRIPT_PATH` | script the child runs |
//! | `PROCLINEAGE_PARENT_TOKEN` | parent's token, JSON |
//! | `PROCLINEAGE_SECRET_KEY` | child's derived secret key, hex |
//! | `PROCLINEAGE_PUBLIC_KEY` | child's derived public key, hex |
//!
//! The secret travels only this way. It is never logged, and the child
//! removes the key variables from its environment once it has read them.
//!
//! A process started without this material refuses to build a token, and a
//! process whose registration is rejected exits with [`EXIT_UNAUTHENTICATED`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::error::ReasonCode;
use crate::keys::{KeyError, ProcessKeypair};
use crate::provenance::{ProvenanceError, SignedDecision, Verdict};
use crate::registration::{Registrar, RegistrationRequest};
use crate::token::{ProcessId, ProcessToken, TokenError};

pub const ENV_PROCESS_ID: &str = "PROCLINEAGE_PROCESS_ID";
pub const ENV_SCRIPT_PATH: &str = "PROCLINEAGE_SCRIPT_PATH";
pub const ENV_PARENT_TOKEN: &str = "PROCLINEAGE_PARENT_TOKEN";
pub const ENV_SECRET_KEY: &str = "PROCLINEAGE_SECRET_KEY";
pub const ENV_PUBLIC_KEY: &str = "PROCLINEAGE_PUBLIC_KEY";

/// Exit status of a process that could not authenticate (EX_NOPERM).
pub const EXIT_UNAUTHENTICATED: i32 = 77;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("launch environment is missing {0}; process was not started through the spawn path")]
    MissingVariable(&'static str),

    #[error("handed-off key material is unusable: {0}")]
    Key(#[from] KeyError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("registration rejected: {0}")]
    Rejected(ReasonCode),

    #[error("registration response carried no verdict")]
    NoVerdict,
}

/// Environment for a child launch. Values are wiped on drop and never shown
/// by `Debug`.
pub struct ChildEnv {
    vars: Vec<(&'static str, Zeroizing<String>)>,
}

impl ChildEnv {
    pub fn build(
        process_id: &ProcessId,
        script_path: &str,
        keypair: &ProcessKeypair,
        parent_token: &ProcessToken,
    ) -> Result<Self, TokenError> {
        Ok(Self {
            vars: vec![
                (ENV_PROCESS_ID, Zeroizing::new(process_id.to_string())),
                (ENV_SCRIPT_PATH, Zeroizing::new(script_path.to_string())),
                (ENV_PARENT_TOKEN, Zeroizing::new(parent_token.to_json()?)),
                (ENV_SECRET_KEY, keypair.secret_hex()),
                (ENV_PUBLIC_KEY, Zeroizing::new(keypair.public_key().to_hex())),
            ],
        })
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Debug for ChildEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.vars.iter().map(|(k, _)| *k))
            .finish()
    }
}

/// The running process's own identity: keypair, self-signed token and the
/// parent token it was launched with.
pub struct ProcessIdentity {
    keypair: ProcessKeypair,
    token: ProcessToken,
    parent_token: ProcessToken,
    next_child: AtomicU64,
}

impl ProcessIdentity {
    /// Build the identity from a variable lookup (the real environment, or a
    /// [`ChildEnv`] in tests).
    pub fn from_vars<F>(mut lookup: F) -> Result<Self, HandoffError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut require = |name: &'static str| {
            lookup(name)
                .map(Zeroizing::new)
                .ok_or(HandoffError::MissingVariable(name))
        };

        let secret = require(ENV_SECRET_KEY)?;
        let public = require(ENV_PUBLIC_KEY)?;
        let process_id = ProcessId::new(require(ENV_PROCESS_ID)?.as_str());
        let script_path = require(ENV_SCRIPT_PATH)?;
        let parent_token = ProcessToken::from_json(&require(ENV_PARENT_TOKEN)?)?;
        parent_token.ensure_well_formed()?;

        let keypair = ProcessKeypair::from_hex_pair(&secret, &public)?;
        let token = ProcessToken::issue(
            &keypair,
            process_id,
            Some(*parent_token.public_key()),
            script_path.as_str(),
            Utc::now(),
        )?;

        Ok(Self {
            keypair,
            token,
            parent_token,
            next_child: AtomicU64::new(1),
        })
    }

    /// Build the identity from this process's environment, then remove the
    /// key variables from it.
    pub fn from_env() -> Result<Self, HandoffError> {
        let identity = Self::from_vars(|name| std::env::var(name).ok());
        std::env::remove_var(ENV_SECRET_KEY);
        std::env::remove_var(ENV_PUBLIC_KEY);
        identity
    }

    pub fn process_id(&self) -> &ProcessId {
        self.token.process_id()
    }

    pub fn token(&self) -> &ProcessToken {
        &self.token
    }

    pub fn parent_token(&self) -> &ProcessToken {
        &self.parent_token
    }

    pub fn registration_request(&self) -> RegistrationRequest {
        RegistrationRequest {
            child_token: self.token.clone(),
            parent_token: Some(self.parent_token.clone()),
        }
    }

    /// Sign a validation decision about `subject` with this process's key.
    pub fn sign_decision(
        &self,
        subject: ProcessId,
        verdict: Verdict,
        rationale: impl Into<String>,
    ) -> Result<SignedDecision, ProvenanceError> {
        SignedDecision::sign(&self.keypair, subject, verdict, rationale)
    }

    pub(crate) fn derive_child(&self, child: &ProcessId) -> Result<ProcessKeypair, KeyError> {
        self.keypair.derive_child(child)
    }

    pub(crate) fn next_child_id(&self) -> ProcessId {
        let seq = self.next_child.fetch_add(1, Ordering::SeqCst);
        self.process_id().child(seq)
    }
}

impl fmt::Debug for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIdentity")
            .field("process_id", self.process_id())
            .field("public_key", self.token.public_key())
            .finish_non_exhaustive()
    }
}

/// Register an already-built identity. Must complete before any
/// capability-gated call.
pub fn register(identity: ProcessIdentity, registrar: &dyn Registrar) -> Result<ProcessIdentity, HandoffError> {
    let response = registrar.register(&identity.registration_request());
    match (response.registered, response.error) {
        (true, _) => {
            log::info!("{} registered", identity.process_id());
            Ok(identity)
        }
        (false, Some(reason)) => Err(HandoffError::Rejected(reason)),
        (false, None) => Err(HandoffError::NoVerdict),
    }
}

/// Build the identity from the environment and register it.
pub fn bootstrap(registrar: &dyn Registrar) -> Result<ProcessIdentity, HandoffError> {
    register(ProcessIdentity::from_env()?, registrar)
}

/// [`bootstrap`], exiting the process on any failure.
pub fn bootstrap_or_exit(registrar: &dyn Registrar) -> ProcessIdentity {
    match bootstrap(registrar) {
        Ok(identity) => identity,
        Err(err) => {
            log::error!("refusing to run unauthenticated: {err}");
            std::process::exit(EXIT_UNAUTHENTICATED);
        }
    }
}
