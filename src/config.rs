//! Configuration parsing.
//!
//! A deployment is described by one TOML file:
//!
//! ```toml
//! [genesis]
//! public_key = "3b6a27bc..."
//!
//! [[scripts]]
//! path = "/opt/agents/coordinator"
//! role = "root"
//!
//! [[scripts]]
//! path = "/opt/agents/workers"
//! role = "worker"
//!
//! [limits]
//! max_depth = 8
//!
//! [revocation]
//! cascade = "terminate_descendants"
//! ```
//!
//! Every section except `[genesis]` has defaults. `validate` rejects values
//! that would make the service unusable rather than silently clamping them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::revocation::{RevocationCascade, RevocationList};
use crate::auth::{AuthorizationPolicy, Role, ScriptAllowlist, ScriptRule};
use crate::genesis::GenesisAuthority;
use crate::hierarchy::{HierarchyTracker, ResourceLimits, TerminationSettings};
use crate::journal::{Journal, JournalError};
use crate::keys::{KeyError, PublicKey};
use crate::provenance::ProvenanceStore;
use crate::registration::RegistrationService;
use crate::wait::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid genesis public key: {0}")]
    GenesisKey(#[from] KeyError),

    #[error("could not open journal: {0}")]
    Journal(#[from] JournalError),

    #[error("invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Hex-encoded Ed25519 genesis public key.
    pub public_key: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    pub cascade: RevocationCascade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Distinct approving validators needed to consider a process validated.
    pub quorum: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { quorum: 1 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub path: Option<PathBuf>,
}

/// Top-level lineage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageConfig {
    pub genesis: GenesisConfig,

    #[serde(default)]
    pub scripts: Vec<ScriptRule>,

    #[serde(default)]
    pub limits: ResourceLimits,

    #[serde(default)]
    pub termination: TerminationSettings,

    #[serde(default)]
    pub spawn: RetryPolicy,

    #[serde(default)]
    pub revocation: RevocationConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub journal: JournalConfig,
}

impl LineageConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.genesis_key()?;

        if self.scripts.is_empty() {
            return Err(ConfigError::Validation(
                "at least one [[scripts]] entry is required".into(),
            ));
        }
        if !self.scripts.iter().any(|r| r.role == Role::Root) {
            return Err(ConfigError::Validation(
                "no [[scripts]] entry for the root process".into(),
            ));
        }
        if let Some(rule) = self.scripts.iter().find(|r| !r.path.is_absolute()) {
            return Err(ConfigError::Validation(format!(
                "script path {} is not absolute",
                rule.path.display()
            )));
        }
        if self.limits.max_live == 0 || self.limits.max_children == 0 {
            return Err(ConfigError::Validation(
                "limits.max_live and limits.max_children must be positive".into(),
            ));
        }
        if self.limits.process_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "limits.process_timeout_secs must be positive".into(),
            ));
        }
        if self.termination.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "termination.poll_interval_ms must be positive".into(),
            ));
        }
        if self.spawn.max_attempts == 0 {
            return Err(ConfigError::Validation("spawn.max_attempts must be positive".into()));
        }
        if self.validation.quorum == 0 {
            return Err(ConfigError::Validation("validation.quorum must be positive".into()));
        }
        Ok(())
    }

    pub fn genesis_key(&self) -> Result<PublicKey, ConfigError> {
        let key = PublicKey::from_hex(&self.genesis.public_key)?;
        key.verifying_key()?;
        Ok(key)
    }

    pub fn genesis_authority(&self) -> Result<GenesisAuthority, ConfigError> {
        let policy = AuthorizationPolicy::new(ScriptAllowlist::new(self.scripts.clone()));
        Ok(GenesisAuthority::new(self.genesis_key()?, policy))
    }

    /// Assemble a registration service (and its journal, if configured).
    pub fn build_service(&self) -> Result<RegistrationService, ConfigError> {
        let store = match &self.journal.path {
            Some(path) => ProvenanceStore::with_journal(Journal::open(path)?),
            None => ProvenanceStore::new(),
        };
        Ok(RegistrationService::new(
            Arc::new(self.genesis_authority()?),
            Arc::new(store),
            Arc::new(RevocationList::new()),
            Arc::new(HierarchyTracker::new(self.limits, self.termination)),
        )
        .with_cascade(self.revocation.cascade)
        .with_quorum(self.validation.quorum))
    }
}
