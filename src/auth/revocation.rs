//! Revocation list
//!
//! Keys are added by an administrative action and never removed. A revoked
//! key blocks every future registration whose lineage contains it, directly or
//! as an ancestor. Already-accepted entries are not rewritten; whether running
//! descendants get terminated is decided by [`RevocationCascade`].

use std::collections::HashSet;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::keys::PublicKey;
use crate::token::ProcessToken;

/// What a revocation does to processes that are already running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationCascade {
    /// Only future registrations are rejected.
    #[default]
    BlockFutureOnly,
    /// Every tracked process holding the key has its subtree terminated.
    TerminateDescendants,
}

#[derive(Debug, Default)]
pub struct RevocationList {
    keys: RwLock<HashSet<PublicKey>>,
}

impl RevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the key was not revoked before.
    pub fn revoke(&self, key: PublicKey) -> bool {
        self.keys.write().insert(key)
    }

    pub fn is_revoked(&self, key: &PublicKey) -> bool {
        self.keys.read().contains(key)
    }

    /// First revoked key found along a chain, checking each token's own key
    /// and its parent reference.
    pub fn first_revoked<'a, I>(&self, chain: I) -> Option<PublicKey>
    where
        I: IntoIterator<Item = &'a ProcessToken>,
    {
        let keys = self.keys.read();
        chain.into_iter().find_map(|token| {
            std::iter::once(token.public_key())
                .chain(token.parent_public_key())
                .find(|k| keys.contains(*k))
                .copied()
        })
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::keys::ProcessKeypair;
    use crate::token::ProcessId;

    #[test]
    fn revoke_is_idempotent() {
        let list = RevocationList::new();
        let key = ProcessKeypair::from_secret([3u8; 32]).public_key();
        assert!(list.revoke(key));
        assert!(!list.revoke(key));
        assert!(list.is_revoked(&key));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn finds_revoked_parent_reference() {
        let parent = ProcessKeypair::from_secret([4u8; 32]);
        let child = ProcessKeypair::from_secret([5u8; 32]);
        let token = ProcessToken::issue(
            &child,
            ProcessId::new("r.1"),
            Some(parent.public_key()),
            "/opt/w.sh",
            Utc::now(),
        )
        .unwrap();

        let list = RevocationList::new();
        assert_eq!(list.first_revoked([&token]), None);
        list.revoke(parent.public_key());
        assert_eq!(list.first_revoked([&token]), Some(parent.public_key()));
    }
}
