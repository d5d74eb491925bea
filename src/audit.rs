//! Offline audit
//!
//! Everything needed to check lineage after the fact is in the journal: each
//! `Registered` record carries the full token and the parent's process id.
//! These functions rebuild state from the records alone and run the same pure
//! lineage verifier the registration service uses. No live store is
//! consulted.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::hierarchy::{HierarchyTracker, ResourceLimits, TerminationSettings};
use crate::journal::JournalRecord;
use crate::keys::PublicKey;
use crate::lineage::{verify_chain, LineageError};
use crate::provenance::{ProvenanceEntry, RejectionRecord};
use crate::token::{ProcessId, ProcessToken};

/// Ledger state folded from journal records.
#[derive(Debug, Clone, Default)]
pub struct JournalState {
    pub entries: BTreeMap<ProcessId, ProvenanceEntry>,
    pub rejections: Vec<RejectionRecord>,
    pub revoked: Vec<PublicKey>,
}

impl JournalState {
    /// Token chain from `pid` up to its root, nearest first.
    pub fn chain(&self, pid: &ProcessId) -> Result<Vec<ProcessToken>, LineageError> {
        let mut chain = Vec::new();
        let mut cursor = Some(pid.clone());
        while let Some(current) = cursor {
            if chain.len() > self.entries.len() {
                return Err(LineageError::Broken {
                    process_id: pid.clone(),
                    detail: "parent references loop".into(),
                });
            }
            let entry = self.entries.get(&current).ok_or_else(|| LineageError::Broken {
                process_id: pid.clone(),
                detail: format!("ancestor {current} missing from journal"),
            })?;
            chain.push(entry.token.clone());
            cursor = entry.parent_process_id.clone();
        }
        Ok(chain)
    }
}

/// Fold journal records into ledger state.
pub fn replay(records: &[JournalRecord]) -> JournalState {
    let mut state = JournalState::default();
    for record in records {
        match record {
            JournalRecord::Registered { entry } => {
                if state.entries.contains_key(&entry.process_id) {
                    continue;
                }
                state.entries.insert(entry.process_id.clone(), entry.clone());
                if let Some(parent) = entry
                    .parent_process_id
                    .as_ref()
                    .and_then(|p| state.entries.get_mut(p))
                {
                    parent.children.push(entry.process_id.clone());
                }
            }
            JournalRecord::Terminated {
                process_id,
                at,
                exit_status,
            } => {
                if let Some(e) = state.entries.get_mut(process_id) {
                    if e.terminated_at.is_none() {
                        e.terminated_at = Some(*at);
                        e.exit_status = *exit_status;
                    }
                }
            }
            JournalRecord::Decision { validator, decision } => {
                if let Some(e) = state.entries.get_mut(validator) {
                    e.decisions.push(decision.clone());
                }
            }
            JournalRecord::Rejected { rejection } => state.rejections.push(rejection.clone()),
            JournalRecord::Revoked { public_key, .. } => state.revoked.push(*public_key),
        }
    }
    state
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JournalAudit {
    pub verified: Vec<ProcessId>,
    pub failures: Vec<(ProcessId, String)>,
}

impl JournalAudit {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Verify the lineage of every registered process in a journal.
pub fn verify_journal(records: &[JournalRecord], genesis: &PublicKey) -> JournalAudit {
    let state = replay(records);
    let mut audit = JournalAudit::default();
    for pid in state.entries.keys() {
        match state.chain(pid).and_then(|chain| verify_chain(&chain, genesis)) {
            Ok(()) => audit.verified.push(pid.clone()),
            Err(err) => {
                log::warn!("journal lineage of {pid} fails: {err}");
                audit.failures.push((pid.clone(), err.to_string()));
            }
        }
    }
    audit
}

/// Rebuild a hierarchy tracker by replaying registrations and exits in
/// journal order, which reproduces orphan edges as they happened.
pub fn rebuild_tracker(records: &[JournalRecord]) -> HierarchyTracker {
    let tracker = HierarchyTracker::new(
        ResourceLimits {
            max_depth: usize::MAX,
            max_children: usize::MAX,
            max_live: usize::MAX,
            process_timeout_secs: u64::MAX,
        },
        TerminationSettings::default(),
    );
    let mut depths: BTreeMap<ProcessId, usize> = BTreeMap::new();
    for record in records {
        match record {
            JournalRecord::Registered { entry } => {
                let depth = entry
                    .parent_process_id
                    .as_ref()
                    .and_then(|p| depths.get(p))
                    .map_or(0, |d| d + 1);
                depths.insert(entry.process_id.clone(), depth);
                if let Err(err) = tracker.register(
                    entry.process_id.clone(),
                    entry.parent_process_id.clone(),
                    entry.role,
                    depth,
                ) {
                    log::warn!("journal replay: {err}");
                }
            }
            JournalRecord::Terminated {
                process_id,
                exit_status,
                ..
            } => {
                if let Err(err) = tracker.mark_exited(process_id, *exit_status) {
                    log::warn!("journal replay: {err}");
                }
            }
            _ => {}
        }
    }
    tracker
}
