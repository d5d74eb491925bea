//! Registration service
//!
//! The one mutable coordination point. It never creates identity: processes
//! arrive with self-signed tokens and the service only decides whether to
//! record them. Checks run in a fixed order:
//!
//! 1. lineage: child signature, then the chain through the registered parent
//!    up to the genesis key
//! 2. script path against the allow-list
//! 3. revocation of any key in the presented lineage
//! 4. role transition (parent role -> child role)
//! 5. duplicate process id
//! 6. resource limits
//!
//! Signature and lineage checks run concurrently. Steps 5 and 6, the insert
//! and the tracker update share one admission lock, so racing siblings cannot
//! both take the last slot under a parent.
//!
//! Every rejection is journaled before the caller sees the response. A
//! rejected process must exit; see [`crate::handoff::bootstrap_or_exit`].

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::auth::revocation::{RevocationCascade, RevocationList};
use crate::auth::{Role, SpawnDecision};
use crate::error::{ReasonCode, RegistrationError};
use crate::genesis::GenesisAuthority;
use crate::hierarchy::{HierarchyTracker, ProcessSignaler, ProcessTree, TrackerError};
use crate::journal::JournalError;
use crate::keys::PublicKey;
use crate::lineage::verify_lineage;
use crate::provenance::{
    NewEntry, ProvenanceEntry, ProvenanceError, ProvenanceStore, RejectionRecord, SignedDecision,
};
use crate::token::{ProcessId, ProcessToken};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub child_token: ProcessToken,
    pub parent_token: Option<ProcessToken>,
}

/// Response to a registration call. No token is ever returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub registered: bool,
    pub error: Option<ReasonCode>,
}

impl RegistrationResponse {
    pub const fn accepted() -> Self {
        Self {
            registered: true,
            error: None,
        }
    }

    pub const fn rejected(reason: ReasonCode) -> Self {
        Self {
            registered: false,
            error: Some(reason),
        }
    }
}

/// Anything a starting process can register with.
pub trait Registrar {
    fn register(&self, request: &RegistrationRequest) -> RegistrationResponse;
}

/// Result of an administrative revocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevocationOutcome {
    pub newly_revoked: bool,
    pub terminated: Vec<ProcessId>,
}

pub struct RegistrationService {
    genesis: Arc<GenesisAuthority>,
    store: Arc<ProvenanceStore>,
    revocations: Arc<RevocationList>,
    tracker: Arc<HierarchyTracker>,
    cascade: RevocationCascade,
    quorum: usize,
    admission: Mutex<()>,
}

impl RegistrationService {
    pub fn new(
        genesis: Arc<GenesisAuthority>,
        store: Arc<ProvenanceStore>,
        revocations: Arc<RevocationList>,
        tracker: Arc<HierarchyTracker>,
    ) -> Self {
        Self {
            genesis,
            store,
            revocations,
            tracker,
            cascade: RevocationCascade::default(),
            quorum: 1,
            admission: Mutex::new(()),
        }
    }

    pub fn with_cascade(mut self, cascade: RevocationCascade) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn genesis(&self) -> &GenesisAuthority {
        &self.genesis
    }

    pub fn store(&self) -> &ProvenanceStore {
        &self.store
    }

    pub fn tracker(&self) -> &HierarchyTracker {
        &self.tracker
    }

    pub fn revocations(&self) -> &RevocationList {
        &self.revocations
    }

    /// Register a process, returning its new provenance entry.
    ///
    /// On failure the rejection has already been journaled.
    pub fn register_entry(
        &self,
        request: &RegistrationRequest,
    ) -> Result<ProvenanceEntry, RegistrationError> {
        match self.admit(request) {
            Ok(entry) => {
                log::info!(
                    "registered {} as {} (parent {:?}, entry #{})",
                    entry.process_id,
                    entry.role,
                    entry.parent_process_id.as_ref().map(ProcessId::as_str),
                    entry.sequence
                );
                Ok(entry)
            }
            Err(err) => {
                self.record_rejection(request, &err);
                Err(err)
            }
        }
    }

    fn record_rejection(&self, request: &RegistrationRequest, err: &RegistrationError) {
        let child = request.child_token.process_id();
        log::warn!("rejected registration of {child}: {} ({err})", err.reason());
        let record = RejectionRecord {
            at: Utc::now(),
            process_id: child.clone(),
            parent_process_id: request
                .parent_token
                .as_ref()
                .map(|t| t.process_id().clone()),
            reason: err.reason(),
            detail: err.to_string(),
        };
        if let Err(journal_err) = self.store.record_rejection(record) {
            log::error!("could not journal rejection of {child}: {journal_err}");
        }
    }

    fn admit(&self, request: &RegistrationRequest) -> Result<ProvenanceEntry, RegistrationError> {
        let child = &request.child_token;
        let pid = child.process_id();

        // (a) lineage
        if !child.verify_signature() {
            return Err(RegistrationError::SignatureInvalid(pid.clone()));
        }
        let (ancestors, parent_entry) = self.resolve_parent(request)?;
        verify_lineage(child, &ancestors, self.genesis.public_key())?;

        // (b) script allow-list; the role decision is applied at (d)
        let policy = self.genesis.policy();
        let decision = match &parent_entry {
            None => policy.check_root(child.script_path()),
            Some(parent) => policy.check_spawn(parent.role, child.script_path()),
        };
        let role = match decision {
            SpawnDecision::ScriptNotAllowlisted => {
                return Err(RegistrationError::ScriptNotAllowlisted {
                    script: child.script_path().to_string(),
                })
            }
            SpawnDecision::Allowed { role } => Ok(role),
            SpawnDecision::PolicyViolation { parent, child } => {
                Err(RegistrationError::PolicyViolation { parent, child })
            }
        };

        // (c) revocation, anywhere in the lineage
        if let Some(key) = self
            .revocations
            .first_revoked(std::iter::once(child).chain(ancestors.iter()))
        {
            return Err(RegistrationError::RevokedKey { key });
        }

        // (d) role transition
        let role = role?;

        let _admission = self.admission.lock();

        // (e) duplicate id
        if self.store.contains(pid) {
            return Err(RegistrationError::DuplicateRegistration(pid.clone()));
        }

        // (f) resource limits
        let parent_pid = parent_entry.as_ref().map(|e| e.process_id.clone());
        let depth = ancestors.len();
        self.tracker
            .check_admission(parent_pid.as_ref(), depth)
            .map_err(|e| RegistrationError::LimitExceeded(e.to_string()))?;

        let entry = self
            .store
            .insert(NewEntry {
                token: child.clone(),
                role,
                parent: parent_pid.clone(),
            })
            .map_err(|e| match e {
                ProvenanceError::Duplicate(pid) => RegistrationError::DuplicateRegistration(pid),
                ProvenanceError::Journal(j) => RegistrationError::Audit(j),
                other => RegistrationError::broken(pid, other.to_string()),
            })?;

        if let Err(err) = self.tracker.register(pid.clone(), parent_pid, role, depth) {
            log::warn!("tracker out of step with store for {pid}: {err}");
        }
        Ok(entry)
    }

    /// Ancestors (nearest first) and the parent's entry for a non-root child.
    fn resolve_parent(
        &self,
        request: &RegistrationRequest,
    ) -> Result<(Vec<ProcessToken>, Option<ProvenanceEntry>), RegistrationError> {
        let child = &request.child_token;
        let pid = child.process_id();

        if child.is_root_assertion() {
            if request.parent_token.is_some() {
                return Err(RegistrationError::broken(
                    pid,
                    "root assertion presented together with a parent token",
                ));
            }
            return Ok((Vec::new(), None));
        }

        let parent = request
            .parent_token
            .as_ref()
            .ok_or_else(|| RegistrationError::broken(pid, "parent token missing"))?;
        let entry = self.store.get(parent.process_id()).ok_or_else(|| {
            RegistrationError::broken(pid, format!("parent {} is not registered", parent.process_id()))
        })?;
        if &entry.token != parent {
            return Err(RegistrationError::broken(
                pid,
                "presented parent token differs from the registered one",
            ));
        }
        let ancestors = self
            .store
            .lineage(parent.process_id())
            .map_err(|e| RegistrationError::broken(pid, e.to_string()))?;
        Ok((ancestors, Some(entry)))
    }

    /// Exit notification from a process or its supervisor.
    pub fn notify_exit(&self, pid: &ProcessId, exit_status: Option<i32>) -> Result<(), ProvenanceError> {
        self.store.record_termination(pid, exit_status)?;
        match self.tracker.mark_exited(pid, exit_status) {
            Ok(_) => {}
            Err(TrackerError::UnknownProcess(_)) => log::debug!("exit of untracked process {pid}"),
            Err(err) => log::warn!("exit of {pid}: {err}"),
        }
        Ok(())
    }

    /// Terminate a subtree and record each termination in the store.
    pub fn terminate_tree(
        &self,
        root: &ProcessId,
        forceful: bool,
        signaler: &dyn ProcessSignaler,
    ) -> Result<Vec<ProcessId>, TrackerError> {
        let terminated = self.tracker.terminate_tree(root, forceful, signaler)?;
        for pid in &terminated {
            if let Err(err) = self.store.record_termination(pid, None) {
                log::warn!("could not record termination of {pid}: {err}");
            }
        }
        Ok(terminated)
    }

    /// Reap processes past their wall-clock timeout.
    pub fn reap_expired(&self, now: Instant) -> Vec<ProcessId> {
        let reaped = self.tracker.reap_expired(now);
        for pid in &reaped {
            if let Err(err) = self.store.record_termination(pid, None) {
                log::warn!("could not record reaping of {pid}: {err}");
            }
        }
        reaped
    }

    /// Revoke a key for all future registrations.
    ///
    /// With [`RevocationCascade::TerminateDescendants`] and a signaler, every
    /// tracked process holding the key has its subtree terminated as well.
    pub fn revoke(
        &self,
        key: PublicKey,
        signaler: Option<&dyn ProcessSignaler>,
    ) -> Result<RevocationOutcome, JournalError> {
        let mut outcome = RevocationOutcome::default();
        // the list decides who journals, so racing calls write one record;
        // a journal failure leaves the key revoked
        if self.revocations.revoke(key) {
            outcome.newly_revoked = true;
            log::warn!("revoked key {key}");
            self.store.record_revocation(key)?;
        }

        if self.cascade == RevocationCascade::TerminateDescendants {
            match signaler {
                Some(signaler) => {
                    for holder in self.store.holders_of(&key) {
                        match self.terminate_tree(&holder, false, signaler) {
                            Ok(ids) => outcome.terminated.extend(ids),
                            Err(err) => log::debug!("cascade skipped {holder}: {err}"),
                        }
                    }
                }
                None => log::warn!("revocation cascade requested without a signaler; nothing terminated"),
            }
        }
        Ok(outcome)
    }

    /// Attach a validator's signed decision to its own entry.
    pub fn record_decision(
        &self,
        validator: &ProcessId,
        decision: SignedDecision,
    ) -> Result<(), ProvenanceError> {
        self.store.record_decision(validator, decision)
    }

    /// Whether `subject` has been approved by the configured quorum of
    /// validators.
    pub fn is_validated(&self, subject: &ProcessId) -> bool {
        self.store.quorum_reached(subject, self.quorum)
    }

    /// Role recorded for a registered process.
    pub fn role_of(&self, pid: &ProcessId) -> Option<Role> {
        self.store.get(pid).map(|e| e.role)
    }

    /// Reattached subtree under `root`.
    pub fn subtree(&self, root: &ProcessId) -> Option<ProcessTree> {
        self.tracker.get_tree(root)
    }

    /// Tokens from `pid` back to the root, nearest first, for offline
    /// verification.
    pub fn lineage_chain(&self, pid: &ProcessId) -> Result<Vec<ProcessToken>, ProvenanceError> {
        self.store.lineage(pid)
    }
}

impl Registrar for RegistrationService {
    fn register(&self, request: &RegistrationRequest) -> RegistrationResponse {
        match self.register_entry(request) {
            Ok(_) => RegistrationResponse::accepted(),
            Err(err) => RegistrationResponse::rejected(err.reason()),
        }
    }
}
