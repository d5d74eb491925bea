//! Provenance store
//!
//! Append-only ledger of registered processes. An entry is created once, on
//! successful registration, and is never deleted. After creation only these
//! fields change, each through a dedicated method:
//! - `children` (append only, together with the child's own insert)
//! - `terminated_at` / `exit_status` (set once)
//! - `decisions` (append only, validators on their own entry)
//!
//! Readers always receive snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Role;
use crate::error::ReasonCode;
use crate::journal::{Journal, JournalError, JournalRecord};
use crate::keys::{hex_bytes, ProcessKeypair, PublicKey};
use crate::token::{ProcessId, ProcessToken};

#[derive(Debug, Error)]
pub enum ProvenanceError {
    #[error("process {0} has no provenance entry")]
    UnknownProcess(ProcessId),

    #[error("process {0} already has a provenance entry")]
    Duplicate(ProcessId),

    #[error("process {0} is not a validator")]
    NotValidator(ProcessId),

    #[error("decision signature from {0} does not verify")]
    DecisionSignatureInvalid(ProcessId),

    #[error("decision encoding failed: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("lineage of {0} loops or exceeds the store")]
    Cycle(ProcessId),

    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Outcome a validator assigns to the process it checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
}

#[derive(Serialize)]
struct DecisionPayload<'a> {
    version: u8,
    subject: &'a str,
    verdict: Verdict,
    rationale: &'a str,
    decided_at: String,
}

/// A validator's decision, signed with the validator's own process key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDecision {
    pub subject: ProcessId,
    pub verdict: Verdict,
    pub rationale: String,
    pub decided_at: DateTime<Utc>,
    #[serde(with = "hex_bytes")]
    pub signature: [u8; 64],
}

impl SignedDecision {
    pub fn sign(
        keypair: &ProcessKeypair,
        subject: ProcessId,
        verdict: Verdict,
        rationale: impl Into<String>,
    ) -> Result<Self, ProvenanceError> {
        let mut decision = Self {
            subject,
            verdict,
            rationale: rationale.into(),
            decided_at: Utc::now(),
            signature: [0u8; 64],
        };
        decision.signature = keypair.sign(&decision.payload()?);
        Ok(decision)
    }

    fn payload(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(&DecisionPayload {
            version: 1,
            subject: self.subject.as_str(),
            verdict: self.verdict,
            rationale: &self.rationale,
            decided_at: self.decided_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        })
    }

    pub fn verify(&self, key: &PublicKey) -> bool {
        match self.payload() {
            Ok(payload) => key.verify(&payload, &self.signature),
            Err(_) => false,
        }
    }
}

/// Durable record of one registered process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    /// Position in the ledger; parent references point at this.
    pub sequence: u64,
    pub process_id: ProcessId,
    pub token: ProcessToken,
    pub role: Role,
    pub script_path: String,
    pub parent_process_id: Option<ProcessId>,
    pub parent_entry: Option<u64>,
    pub spawned_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub exit_status: Option<i32>,
    pub children: Vec<ProcessId>,
    pub decisions: Vec<SignedDecision>,
}

impl ProvenanceEntry {
    pub fn is_terminated(&self) -> bool {
        self.terminated_at.is_some()
    }
}

/// Fields of a new entry; the store assigns the sequence number.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub token: ProcessToken,
    pub role: Role,
    pub parent: Option<ProcessId>,
}

/// A refused registration, kept for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub at: DateTime<Utc>,
    pub process_id: ProcessId,
    pub parent_process_id: Option<ProcessId>,
    pub reason: ReasonCode,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct ProvenanceStore {
    entries: RwLock<HashMap<ProcessId, Arc<Mutex<ProvenanceEntry>>>>,
    next_sequence: AtomicU64,
    rejections: Mutex<Vec<RejectionRecord>>,
    journal: Option<Journal>,
}

impl ProvenanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that mirrors every mutation into an append-only journal.
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    fn journal(&self, record: JournalRecord) -> Result<(), JournalError> {
        match &self.journal {
            Some(journal) => journal.append(&record),
            None => Ok(()),
        }
    }

    fn handle(&self, pid: &ProcessId) -> Result<Arc<Mutex<ProvenanceEntry>>, ProvenanceError> {
        self.entries
            .read()
            .get(pid)
            .cloned()
            .ok_or_else(|| ProvenanceError::UnknownProcess(pid.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, pid: &ProcessId) -> bool {
        self.entries.read().contains_key(pid)
    }

    pub fn get(&self, pid: &ProcessId) -> Option<ProvenanceEntry> {
        let handle = self.entries.read().get(pid).cloned()?;
        let entry = handle.lock().clone();
        Some(entry)
    }

    /// Create an entry and link it into its parent's child list.
    ///
    /// The duplicate check, the single `Registered` journal record and both
    /// in-memory changes happen under the map's write lock. If the journal
    /// write fails nothing is changed.
    pub fn insert(&self, new: NewEntry) -> Result<ProvenanceEntry, ProvenanceError> {
        let mut entries = self.entries.write();
        let pid = new.token.process_id().clone();
        if entries.contains_key(&pid) {
            return Err(ProvenanceError::Duplicate(pid));
        }

        let parent_handle = match &new.parent {
            Some(parent) => Some(
                entries
                    .get(parent)
                    .cloned()
                    .ok_or_else(|| ProvenanceError::UnknownProcess(parent.clone()))?,
            ),
            None => None,
        };
        let mut parent = parent_handle.as_ref().map(|handle| handle.lock());

        let entry = ProvenanceEntry {
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            process_id: pid.clone(),
            script_path: new.token.script_path().to_string(),
            token: new.token,
            role: new.role,
            parent_process_id: new.parent,
            parent_entry: parent.as_ref().map(|p| p.sequence),
            spawned_at: Utc::now(),
            terminated_at: None,
            exit_status: None,
            children: Vec::new(),
            decisions: Vec::new(),
        };

        self.journal(JournalRecord::Registered {
            entry: entry.clone(),
        })?;
        if let Some(parent) = parent.as_mut() {
            parent.children.push(pid.clone());
        }
        entries.insert(pid, Arc::new(Mutex::new(entry.clone())));
        Ok(entry)
    }

    /// Record exit. Only the first notification is kept; returns whether this
    /// call recorded it.
    pub fn record_termination(
        &self,
        pid: &ProcessId,
        exit_status: Option<i32>,
    ) -> Result<bool, ProvenanceError> {
        let handle = self.handle(pid)?;
        let mut entry = handle.lock();
        if entry.terminated_at.is_some() {
            return Ok(false);
        }
        let at = Utc::now();
        self.journal(JournalRecord::Terminated {
            process_id: pid.clone(),
            at,
            exit_status,
        })?;
        entry.terminated_at = Some(at);
        entry.exit_status = exit_status;
        Ok(true)
    }

    /// Attach a validator's signed decision to the validator's own entry.
    pub fn record_decision(
        &self,
        validator: &ProcessId,
        decision: SignedDecision,
    ) -> Result<(), ProvenanceError> {
        let handle = self.handle(validator)?;
        let mut entry = handle.lock();
        if entry.role != Role::Validator {
            return Err(ProvenanceError::NotValidator(validator.clone()));
        }
        if !decision.verify(entry.token.public_key()) {
            return Err(ProvenanceError::DecisionSignatureInvalid(validator.clone()));
        }
        self.journal(JournalRecord::Decision {
            validator: validator.clone(),
            decision: decision.clone(),
        })?;
        entry.decisions.push(decision);
        Ok(())
    }

    /// Every decision issued about `subject`, with its validator.
    pub fn decisions_for(&self, subject: &ProcessId) -> Vec<(ProcessId, SignedDecision)> {
        let handles: Vec<_> = self.entries.read().values().cloned().collect();
        let mut found: Vec<(ProcessId, SignedDecision)> = handles
            .iter()
            .flat_map(|h| {
                let entry = h.lock();
                entry
                    .decisions
                    .iter()
                    .filter(|d| &d.subject == subject)
                    .map(|d| (entry.process_id.clone(), d.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by_key(|(_, d)| d.decided_at);
        found
    }

    /// Distinct validators whose latest decision on `subject` is an approval.
    pub fn approvals(&self, subject: &ProcessId) -> usize {
        let mut latest: HashMap<ProcessId, Verdict> = HashMap::new();
        for (validator, decision) in self.decisions_for(subject) {
            latest.insert(validator, decision.verdict);
        }
        latest.values().filter(|v| **v == Verdict::Approve).count()
    }

    pub fn quorum_reached(&self, subject: &ProcessId, quorum: usize) -> bool {
        quorum > 0 && self.approvals(subject) >= quorum
    }

    /// Tokens from `pid` up to the root, nearest first.
    pub fn lineage(&self, pid: &ProcessId) -> Result<Vec<ProcessToken>, ProvenanceError> {
        let entries = self.entries.read();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(pid.clone());

        while let Some(current) = cursor {
            if !seen.insert(current.clone()) {
                return Err(ProvenanceError::Cycle(pid.clone()));
            }
            let entry = entries
                .get(&current)
                .ok_or_else(|| ProvenanceError::UnknownProcess(current.clone()))?
                .lock();
            chain.push(entry.token.clone());
            cursor = entry.parent_process_id.clone();
        }
        Ok(chain)
    }

    /// Ids of processes whose own token carries `key`.
    pub fn holders_of(&self, key: &PublicKey) -> Vec<ProcessId> {
        let mut found: Vec<ProcessId> = self
            .entries
            .read()
            .values()
            .filter_map(|h| {
                let entry = h.lock();
                (entry.token.public_key() == key).then(|| entry.process_id.clone())
            })
            .collect();
        found.sort();
        found
    }

    /// Record a refused registration. Journaled before returning.
    pub fn record_rejection(&self, record: RejectionRecord) -> Result<(), JournalError> {
        self.journal(JournalRecord::Rejected {
            rejection: record.clone(),
        })?;
        self.rejections.lock().push(record);
        Ok(())
    }

    pub fn rejections(&self) -> Vec<RejectionRecord> {
        self.rejections.lock().clone()
    }

    /// Record an administrative revocation in the journal.
    pub fn record_revocation(&self, key: PublicKey) -> Result<(), JournalError> {
        self.journal(JournalRecord::Revoked {
            public_key: key,
            at: Utc::now(),
        })
    }

    /// All entries ordered by sequence.
    pub fn snapshot(&self) -> Vec<ProvenanceEntry> {
        let mut all: Vec<ProvenanceEntry> = self
            .entries
            .read()
            .values()
            .map(|h| h.lock().clone())
            .collect();
        all.sort_by_key(|e| e.sequence);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(kp: &ProcessKeypair, pid: &str, parent: Option<&ProcessKeypair>) -> ProcessToken {
        ProcessToken::issue(
            kp,
            ProcessId::new(pid),
            parent.map(ProcessKeypair::public_key),
            "/opt/agents/workers/w.sh",
            Utc::now(),
        )
        .unwrap()
    }

    fn store_with_root() -> (ProvenanceStore, ProcessKeypair) {
        let store = ProvenanceStore::new();
        let root = ProcessKeypair::from_secret([1u8; 32]);
        store
            .insert(NewEntry {
                token: token(&root, "root", None),
                role: Role::Root,
                parent: None,
            })
            .unwrap();
        (store, root)
    }

    #[test]
    fn insert_links_parent_entry() {
        let (store, root) = store_with_root();
        let kp = root.derive_child(&ProcessId::new("root.1")).unwrap();
        let entry = store
            .insert(NewEntry {
                token: token(&kp, "root.1", Some(&root)),
                role: Role::Worker,
                parent: Some(ProcessId::new("root")),
            })
            .unwrap();
        assert_eq!(entry.parent_entry, Some(0));
        assert_eq!(entry.sequence, 1);
        assert_eq!(
            store.get(&ProcessId::new("root")).unwrap().children,
            vec![ProcessId::new("root.1")]
        );

        let chain = store.lineage(&ProcessId::new("root.1")).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].process_id().as_str(), "root");
    }

    #[test]
    fn duplicate_insert_rejected() {
        let (store, root) = store_with_root();
        let again = store.insert(NewEntry {
            token: token(&root, "root", None),
            role: Role::Root,
            parent: None,
        });
        assert!(matches!(again, Err(ProvenanceError::Duplicate(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn termination_is_set_once() {
        let (store, _) = store_with_root();
        let root = ProcessId::new("root");
        assert!(store.record_termination(&root, Some(0)).unwrap());
        assert!(!store.record_termination(&root, Some(9)).unwrap());
        assert_eq!(store.get(&root).unwrap().exit_status, Some(0));
    }

    #[test]
    fn decisions_require_validator_and_valid_signature() {
        let (store, root) = store_with_root();
        let vpid = ProcessId::new("root.1");
        let vkp = root.derive_child(&vpid).unwrap();
        store
            .insert(NewEntry {
                token: token(&vkp, "root.1", Some(&root)),
                role: Role::Validator,
                parent: Some(ProcessId::new("root")),
            })
            .unwrap();

        let subject = ProcessId::new("root.2");
        let decision = SignedDecision::sign(&vkp, subject.clone(), Verdict::Approve, "looks right").unwrap();
        store.record_decision(&vpid, decision.clone()).unwrap();
        assert_eq!(store.approvals(&subject), 1);
        assert!(store.quorum_reached(&subject, 1));
        assert!(!store.quorum_reached(&subject, 2));

        let forged = SignedDecision::sign(&root, subject.clone(), Verdict::Approve, "forged").unwrap();
        assert!(matches!(
            store.record_decision(&vpid, forged),
            Err(ProvenanceError::DecisionSignatureInvalid(_))
        ));

        assert!(matches!(
            store.record_decision(&ProcessId::new("root"), decision),
            Err(ProvenanceError::NotValidator(_))
        ));
    }

    #[test]
    fn later_rejection_overrides_approval() {
        let (store, root) = store_with_root();
        let vpid = ProcessId::new("root.1");
        let vkp = root.derive_child(&vpid).unwrap();
        store
            .insert(NewEntry {
                token: token(&vkp, "root.1", Some(&root)),
                role: Role::Validator,
                parent: Some(ProcessId::new("root")),
            })
            .unwrap();
        let subject = ProcessId::new("root.2");
        let approve = SignedDecision::sign(&vkp, subject.clone(), Verdict::Approve, "ok").unwrap();
        store.record_decision(&vpid, approve).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let reject = SignedDecision::sign(&vkp, subject.clone(), Verdict::Reject, "changed").unwrap();
        store.record_decision(&vpid, reject).unwrap();
        assert_eq!(store.approvals(&subject), 0);
    }
}
