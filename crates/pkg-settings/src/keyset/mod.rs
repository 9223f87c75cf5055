//! Key-set registry — reference-counted signing-key lineage.
//!
//! A *key set* is a group of one or more public keys; a package's signature
//! is checked (elsewhere) against the full key membership of the set it
//! claims. The registry tracks which key sets and public keys are in use by
//! which packages and garbage-collects entries whose reference count
//! reaches zero.

pub mod registry;

pub use registry::{KeySetEntry, KeySetRegistry, PublicKeyEntry};

use serde::{Deserialize, Serialize};

/// Identifier for a public key in the registry.
///
/// Allocation is monotonic; an id is never reused, even after the key has
/// been removed, so a stale reference is always detectable as unknown.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PublicKeyId(pub u64);

impl std::fmt::Display for PublicKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a key set in the registry.
///
/// Same monotonic, never-reused allocation discipline as [`PublicKeyId`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct KeySetId(pub u64);

impl std::fmt::Display for KeySetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
