//! Child spawning
//!
//! The parent side of the handoff: mint the child's id, derive its keypair,
//! build the launch environment and call the external spawn primitive.
//! Process creation itself belongs to whatever implements [`Spawner`].
//!
//! Spawn failures that carry no security meaning (resource exhaustion,
//! EAGAIN) are reported as [`SpawnError::Transient`] and retried with bounded
//! backoff. Everything else fails immediately.

use thiserror::Error;

use crate::genesis::RootIdentity;
use crate::handoff::{ChildEnv, ProcessIdentity};
use crate::hierarchy::{HierarchyTracker, TrackerError};
use crate::keys::{KeyError, ProcessKeypair, PublicKey};
use crate::token::{ProcessId, ProcessToken, TokenError};
use crate::wait::RetryPolicy;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("transient spawn failure: {0}")]
    Transient(String),

    #[error("spawn failed: {0}")]
    Fatal(String),

    #[error("spawn still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("child key derivation failed: {0}")]
    Key(#[from] KeyError),

    #[error("could not encode parent token: {0}")]
    Token(#[from] TokenError),

    #[error("spawn not admitted: {0}")]
    NotAdmitted(#[from] TrackerError),
}

/// Opaque handle returned by the spawn primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnHandle {
    pub os_pid: u32,
}

/// External process-creation primitive: `spawn(script_path, args, env)`.
pub trait Spawner {
    fn spawn(&self, script_path: &str, args: &[String], env: &ChildEnv) -> Result<SpawnHandle, SpawnError>;
}

/// A process able to create children: it has a token to hand down and key
/// material to derive from.
pub trait KeySource {
    fn token(&self) -> &ProcessToken;
    fn next_child_id(&self) -> ProcessId;
    fn derive_child(&self, child: &ProcessId) -> Result<ProcessKeypair, KeyError>;
}

impl KeySource for RootIdentity {
    fn token(&self) -> &ProcessToken {
        RootIdentity::token(self)
    }

    fn next_child_id(&self) -> ProcessId {
        RootIdentity::next_child_id(self)
    }

    fn derive_child(&self, child: &ProcessId) -> Result<ProcessKeypair, KeyError> {
        RootIdentity::derive_child(self, child)
    }
}

impl KeySource for ProcessIdentity {
    fn token(&self) -> &ProcessToken {
        ProcessIdentity::token(self)
    }

    fn next_child_id(&self) -> ProcessId {
        ProcessIdentity::next_child_id(self)
    }

    fn derive_child(&self, child: &ProcessId) -> Result<ProcessKeypair, KeyError> {
        ProcessIdentity::derive_child(self, child)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedChild {
    pub process_id: ProcessId,
    pub public_key: PublicKey,
    pub handle: SpawnHandle,
}

/// Spawner plus retry policy plus an optional admission check.
pub struct ChildSpawner<'a> {
    spawner: &'a dyn Spawner,
    retry: RetryPolicy,
    admission: Option<&'a HierarchyTracker>,
}

impl<'a> ChildSpawner<'a> {
    pub fn new(spawner: &'a dyn Spawner, retry: RetryPolicy) -> Self {
        Self {
            spawner,
            retry,
            admission: None,
        }
    }

    /// Check resource limits against `tracker` before each spawn.
    pub fn with_admission(mut self, tracker: &'a HierarchyTracker) -> Self {
        self.admission = Some(tracker);
        self
    }

    pub fn spawn(
        &self,
        parent: &dyn KeySource,
        script_path: &str,
        args: &[String],
    ) -> Result<SpawnedChild, SpawnError> {
        if let Some(tracker) = self.admission {
            tracker.check_spawn(parent.token().process_id())?;
        }

        let process_id = parent.next_child_id();
        let keypair = parent.derive_child(&process_id)?;
        let public_key = keypair.public_key();
        let env = ChildEnv::build(&process_id, script_path, &keypair, parent.token())?;
        drop(keypair);

        let handle = self.spawn_with_retry(script_path, args, &env)?;
        log::info!(
            "spawned {process_id} ({script_path}) as os pid {} from {}",
            handle.os_pid,
            parent.token().process_id()
        );
        Ok(SpawnedChild {
            process_id,
            public_key,
            handle,
        })
    }

    fn spawn_with_retry(&self, script_path: &str, args: &[String], env: &ChildEnv) -> Result<SpawnHandle, SpawnError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self.spawner.spawn(script_path, args, env) {
                Ok(handle) => return Ok(handle),
                Err(SpawnError::Transient(reason)) => {
                    log::warn!("spawn of {script_path} failed transiently (attempt {attempt}/{attempts}): {reason}");
                    last = reason;
                    if attempt < attempts {
                        std::thread::sleep(self.retry.backoff(attempt));
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(SpawnError::RetriesExhausted { attempts, last })
    }
}

/// One-shot [`ChildSpawner::spawn`] without admission checks.
pub fn spawn_child(
    parent: &dyn KeySource,
    spawner: &dyn Spawner,
    script_path: &str,
    args: &[String],
    retry: RetryPolicy,
) -> Result<SpawnedChild, SpawnError> {
    ChildSpawner::new(spawner, retry).spawn(parent, script_path, args)
}
