//! proclineage - cryptographic process lineage for agent hierarchies
//!
//! Every process in a hierarchy proves where it came from:
//! 1. The parent derives the child's Ed25519 keypair from its own secret
//!    (HKDF-SHA256, context = child process id)
//! 2. The child builds and signs its own token from the handed-off key
//! 3. The registration service verifies the chain of tokens back to the
//!    genesis key, checks policy, and records the process
//! 4. Any collaborator can re-verify the same chain offline
//!
//! There is no token issuer. The registration service only accepts or
//! rejects; it never hands out identity.
//!
//! # Modules
//!
//! - [`keys`], [`token`], [`lineage`]: key derivation, tokens and the pure
//!   chain verifier
//! - [`genesis`]: the root of trust and root key custody
//! - [`auth`]: roles, transition table, script allow-list, revocation
//! - [`registration`], [`provenance`], [`hierarchy`]: the coordination
//!   service, its append-only ledger and the live process tree
//! - [`spawn`], [`handoff`]: the parent and child halves of a launch
//! - [`journal`], [`audit`]: durable records and offline verification
//! - [`capability`]: the envelope collaborators receive
//! - [`config`]: TOML deployment configuration

pub mod audit;
pub mod auth;
pub mod capability;
pub mod config;
pub mod error;
pub mod genesis;
pub mod handoff;
pub mod hierarchy;
pub mod journal;
pub mod keys;
pub mod lineage;
pub mod provenance;
pub mod registration;
pub mod spawn;
pub mod token;
pub mod wait;

pub use auth::revocation::{RevocationCascade, RevocationList};
pub use auth::{AuthorizationPolicy, Role, ScriptAllowlist, ScriptRule};
pub use capability::CapabilityCall;
pub use config::LineageConfig;
pub use error::{ReasonCode, RegistrationError};
pub use genesis::{GenesisAuthority, RootCustody, RootIdentity, SoftwareCustody};
pub use handoff::{ChildEnv, ProcessIdentity, EXIT_UNAUTHENTICATED};
pub use hierarchy::{HierarchyTracker, ProcessSignaler, ProcessTree};
pub use keys::{ProcessKeypair, PublicKey};
pub use lineage::{is_valid_chain, verify_chain, verify_lineage};
pub use provenance::{ProvenanceEntry, ProvenanceStore, SignedDecision, Verdict};
pub use registration::{Registrar, RegistrationRequest, RegistrationResponse, RegistrationService};
pub use spawn::{ChildSpawner, KeySource, SpawnHandle, Spawner};
pub use token::{ProcessId, ProcessToken};
