//! Authorization policy
//!
//! # Philosophy
//!
//! Authority is derived, never granted: a process may exist only because a
//! parent that was itself allowed to exist spawned it. The policy here answers
//! two narrow questions for the registration service:
//!
//! - Is this script path inside a permitted location, and which role does it
//!   confer?
//! - May a process of role P spawn a process of role C?
//!
//! Roles are a closed set. Dispatch is by table lookup, never by matching on
//! script names.
//!
//! # Anti-patterns (DO NOT IMPLEMENT)
//!
//! - Letting a validator spawn another validator (it would let a validator
//!   approve its own output through a proxy)
//! - Granting any role the right to spawn a root
//! - Deriving roles from anything the child itself asserts

pub mod revocation;

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Process roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Root,
    Worker,
    Validator,
}

impl Role {
    const COUNT: usize = 3;

    const fn index(self) -> usize {
        match self {
            Role::Root => 0,
            Role::Worker => 1,
            Role::Validator => 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Root => "root",
            Role::Worker => "worker",
            Role::Validator => "validator",
        };
        f.write_str(name)
    }
}

/// Fixed (parent role, child role) transition table.
///
/// Rows are the parent role, columns the child role, both in
/// `Root, Worker, Validator` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionTable {
    allowed: [[bool; Role::COUNT]; Role::COUNT],
}

impl TransitionTable {
    /// root/worker -> worker|validator, validator -> worker. Nobody spawns root.
    pub const STANDARD: TransitionTable = TransitionTable {
        allowed: [
            //  root   worker validator
            [false, true, true],  // root
            [false, true, true],  // worker
            [false, true, false], // validator
        ],
    };

    pub const fn permits(&self, parent: Role, child: Role) -> bool {
        self.allowed[parent.index()][child.index()]
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// One allow-list entry: a permitted script file or directory and the role
/// it confers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRule {
    pub path: PathBuf,
    pub role: Role,
}

impl ScriptRule {
    pub fn new(path: impl Into<PathBuf>, role: Role) -> Self {
        Self {
            path: path.into(),
            role,
        }
    }
}

/// Allow-list of script locations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptAllowlist {
    rules: Vec<ScriptRule>,
}

impl ScriptAllowlist {
    pub fn new(rules: Vec<ScriptRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ScriptRule] {
        &self.rules
    }

    /// Role conferred by `script`, or `None` if it is outside every rule.
    ///
    /// Paths must be absolute and free of `.`/`..` components; the longest
    /// matching rule wins.
    pub fn role_for(&self, script: &str) -> Option<Role> {
        let path = Path::new(script);
        if !path.is_absolute() {
            return None;
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return None;
        }

        self.rules
            .iter()
            .filter(|rule| path.starts_with(&rule.path))
            .max_by_key(|rule| rule.path.components().count())
            .map(|rule| rule.role)
    }
}

/// Whether a spawn was allowed, and if not, why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnDecision {
    Allowed { role: Role },
    ScriptNotAllowlisted,
    PolicyViolation { parent: Role, child: Role },
}

/// Allow-list plus transition table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationPolicy {
    scripts: ScriptAllowlist,
    transitions: TransitionTable,
}

impl AuthorizationPolicy {
    pub fn new(scripts: ScriptAllowlist) -> Self {
        Self {
            scripts,
            transitions: TransitionTable::STANDARD,
        }
    }

    pub fn scripts(&self) -> &ScriptAllowlist {
        &self.scripts
    }

    pub fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }

    /// Role a parentless token would hold. Root tokens still have to run an
    /// allow-listed script, but the role they get is always `Root`.
    pub fn check_root(&self, script: &str) -> SpawnDecision {
        match self.scripts.role_for(script) {
            Some(_) => SpawnDecision::Allowed { role: Role::Root },
            None => SpawnDecision::ScriptNotAllowlisted,
        }
    }

    /// Decide whether `parent` may spawn a process running `script`.
    pub fn check_spawn(&self, parent: Role, script: &str) -> SpawnDecision {
        let Some(child) = self.scripts.role_for(script) else {
            return SpawnDecision::ScriptNotAllowlisted;
        };
        if self.transitions.permits(parent, child) {
            SpawnDecision::Allowed { role: child }
        } else {
            SpawnDecision::PolicyViolation { parent, child }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AuthorizationPolicy {
        AuthorizationPolicy::new(ScriptAllowlist::new(vec![
            ScriptRule::new("/opt/agents/coordinator", Role::Root),
            ScriptRule::new("/opt/agents/workers", Role::Worker),
            ScriptRule::new("/opt/agents/validators", Role::Validator),
            ScriptRule::new("/opt/agents/workers/review", Role::Validator),
        ]))
    }

    #[test]
    fn transition_table() {
        let t = TransitionTable::STANDARD;
        assert!(t.permits(Role::Root, Role::Worker));
        assert!(t.permits(Role::Root, Role::Validator));
        assert!(t.permits(Role::Worker, Role::Worker));
        assert!(t.permits(Role::Worker, Role::Validator));
        assert!(t.permits(Role::Validator, Role::Worker));
        assert!(!t.permits(Role::Validator, Role::Validator));
        for parent in [Role::Root, Role::Worker, Role::Validator] {
            assert!(!t.permits(parent, Role::Root));
        }
    }

    #[test]
    fn allowlist_roles() {
        let p = policy();
        assert_eq!(p.scripts().role_for("/opt/agents/workers/collect.sh"), Some(Role::Worker));
        assert_eq!(
            p.scripts().role_for("/opt/agents/workers/review/check.sh"),
            Some(Role::Validator)
        );
        assert_eq!(p.scripts().role_for("/opt/agents/workersX/evil.sh"), None);
        assert_eq!(p.scripts().role_for("opt/agents/workers/rel.sh"), None);
        assert_eq!(p.scripts().role_for("/opt/agents/workers/../../../bin/sh"), None);
        assert_eq!(p.scripts().role_for("/tmp/x.sh"), None);
    }

    #[test]
    fn spawn_decisions() {
        let p = policy();
        assert_eq!(
            p.check_spawn(Role::Worker, "/opt/agents/validators/v.sh"),
            SpawnDecision::Allowed { role: Role::Validator }
        );
        assert_eq!(
            p.check_spawn(Role::Validator, "/opt/agents/validators/v.sh"),
            SpawnDecision::PolicyViolation {
                parent: Role::Validator,
                child: Role::Validator
            }
        );
        assert_eq!(
            p.check_spawn(Role::Root, "/usr/bin/curl"),
            SpawnDecision::ScriptNotAllowlisted
        );
        assert_eq!(
            p.check_spawn(Role::Worker, "/opt/agents/coordinator/main"),
            SpawnDecision::PolicyViolation {
                parent: Role::Worker,
                child: Role::Root
            }
        );
        assert_eq!(
            p.check_root("/opt/agents/coordinator/main"),
            SpawnDecision::Allowed { role: Role::Root }
        );
    }
}
