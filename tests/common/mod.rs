//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use proclineage::hierarchy::{ResourceLimits, TerminationSettings};
use proclineage::provenance::ProvenanceStore;
use proclineage::spawn::{SpawnError, SpawnedChild};
use proclineage::wait::RetryPolicy;
use proclineage::{
    AuthorizationPolicy, ChildEnv, ChildSpawner, GenesisAuthority, HierarchyTracker, KeySource,
    ProcessId, ProcessIdentity, ProcessSignaler, ProcessToken, PublicKey, RegistrationRequest,
    RegistrationService, RevocationList, Role, RootCustody, RootIdentity, ScriptAllowlist,
    ScriptRule, SoftwareCustody, SpawnHandle, Spawner,
};

pub const COORDINATOR: &str = "/opt/agents/coordinator";
pub const WORKER: &str = "/opt/agents/workers/collect.sh";
pub const VALIDATOR: &str = "/opt/agents/validators/review.sh";

pub const GENESIS_SEED: [u8; 32] = [0x5a; 32];

pub fn policy() -> AuthorizationPolicy {
    AuthorizationPolicy::new(ScriptAllowlist::new(vec![
        ScriptRule::new(COORDINATOR, Role::Root),
        ScriptRule::new("/opt/agents/workers", Role::Worker),
        ScriptRule::new("/opt/agents/validators", Role::Validator),
    ]))
}

pub fn genesis_key() -> PublicKey {
    RootCustody::public_key(&SoftwareCustody::from_seed(GENESIS_SEED))
}

pub fn root_identity() -> RootIdentity {
    RootIdentity::establish(
        Box::new(SoftwareCustody::from_seed(GENESIS_SEED)),
        ProcessId::new("root"),
        COORDINATOR,
    )
    .unwrap()
}

pub fn fast_termination() -> TerminationSettings {
    TerminationSettings {
        grace_timeout_ms: 200,
        poll_interval_ms: 5,
    }
}

pub fn service_with(store: ProvenanceStore, limits: ResourceLimits) -> RegistrationService {
    RegistrationService::new(
        Arc::new(GenesisAuthority::new(genesis_key(), policy())),
        Arc::new(store),
        Arc::new(RevocationList::new()),
        Arc::new(HierarchyTracker::new(limits, fast_termination())),
    )
}

pub fn service() -> RegistrationService {
    service_with(ProvenanceStore::new(), ResourceLimits::default())
}

pub fn root_request(root: &RootIdentity) -> RegistrationRequest {
    RegistrationRequest {
        child_token: root.token().clone(),
        parent_token: None,
    }
}

/// Spawner that records each launch environment instead of starting a
/// process.
#[derive(Default)]
pub struct CapturingSpawner {
    launches: RefCell<Vec<HashMap<String, String>>>,
    next_pid: RefCell<u32>,
}

impl CapturingSpawner {
    pub fn last_env(&self) -> HashMap<String, String> {
        self.launches.borrow().last().cloned().unwrap_or_default()
    }
}

impl Spawner for CapturingSpawner {
    fn spawn(&self, _script: &str, _args: &[String], env: &ChildEnv) -> Result<SpawnHandle, SpawnError> {
        let vars = env
            .vars()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.launches.borrow_mut().push(vars);
        let mut pid = self.next_pid.borrow_mut();
        *pid += 1;
        Ok(SpawnHandle { os_pid: 1000 + *pid })
    }
}

/// Spawn `script` under `parent` and return the child's self-built identity,
/// as the child would build it from its environment.
pub fn spawn_identity(parent: &dyn KeySource, script: &str) -> (SpawnedChild, ProcessIdentity) {
    let spawner = CapturingSpawner::default();
    let child = ChildSpawner::new(&spawner, RetryPolicy::default())
        .spawn(parent, script, &[])
        .unwrap();
    let env = spawner.last_env();
    let identity = ProcessIdentity::from_vars(|k| env.get(k).cloned()).unwrap();
    (child, identity)
}

/// Spawn and register in one step.
pub fn spawn_registered(
    service: &RegistrationService,
    parent: &dyn KeySource,
    script: &str,
) -> ProcessIdentity {
    let (_, identity) = spawn_identity(parent, script);
    service.register_entry(&identity.registration_request()).unwrap();
    identity
}

/// Signaler over a set of "alive" ids. Graceful termination succeeds unless
/// the id is marked stubborn.
#[derive(Default)]
pub struct FakeSignaler {
    alive: Mutex<HashSet<ProcessId>>,
    stubborn: Mutex<HashSet<ProcessId>>,
    pub signals: Mutex<Vec<(String, ProcessId)>>,
}

impl FakeSignaler {
    pub fn with_alive<'a>(ids: impl IntoIterator<Item = &'a ProcessId>) -> Self {
        let signaler = Self::default();
        signaler.alive.lock().extend(ids.into_iter().cloned());
        signaler
    }

    pub fn make_stubborn(&self, pid: &ProcessId) {
        self.stubborn.lock().insert(pid.clone());
    }

    pub fn killed(&self) -> Vec<ProcessId> {
        self.signals
            .lock()
            .iter()
            .filter(|(kind, _)| kind == "kill")
            .map(|(_, pid)| pid.clone())
            .collect()
    }
}

impl ProcessSignaler for FakeSignaler {
    fn terminate(&self, pid: &ProcessId) -> std::io::Result<()> {
        self.signals.lock().push(("term".into(), pid.clone()));
        if !self.stubborn.lock().contains(pid) {
            self.alive.lock().remove(pid);
        }
        Ok(())
    }

    fn kill(&self, pid: &ProcessId) -> std::io::Result<()> {
        self.signals.lock().push(("kill".into(), pid.clone()));
        self.alive.lock().remove(pid);
        Ok(())
    }

    fn is_alive(&self, pid: &ProcessId) -> bool {
        self.alive.lock().contains(pid)
    }
}

/// Copy of `token` with one signature byte flipped, rebuilt through its JSON
/// form.
pub fn corrupt_signature(token: &ProcessToken, index: usize) -> ProcessToken {
    let mut value = serde_json::to_value(token).unwrap();
    let mut signature = hex::decode(value["signature"].as_str().unwrap()).unwrap();
    let len = signature.len();
    signature[index % len] ^= 0xff;
    value["signature"] = serde_json::Value::String(hex::encode(signature));
    serde_json::from_value(value).unwrap()
}

/// Journal sink that keeps what it is given and can be told to fail every
/// write, like a full disk.
#[derive(Clone, Default)]
pub struct SwitchableSink {
    failing: Arc<AtomicBool>,
    pub written: Arc<Mutex<Vec<u8>>>,
}

impl SwitchableSink {
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<proclineage::journal::JournalRecord> {
        let written = self.written.lock();
        String::from_utf8_lossy(&written)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }
}

impl Write for SwitchableSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
        }
        self.written.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
