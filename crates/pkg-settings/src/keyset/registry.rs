//! Reference-counted tables of key sets and public keys.
//!
//! The registry is two flat tables keyed by integer id — public keys and
//! key sets — plus the two monotonic allocation counters. Index-based
//! handles keep the cascading decrement-and-free on removal a simple table
//! update rather than a graph traversal.
//!
//! Reference-count model:
//! - a key set's ref count is the number of packages that hold it as their
//!   proper signing set or as a defined alias target (counted once per
//!   package; an upgrade set is always among the package's defined sets and
//!   carries no extra reference);
//! - a public key's ref count is the number of key sets that include it,
//!   counted once per set.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

use crate::error::{Result, SettingsError};
use crate::keyset::{KeySetId, PublicKeyId};

/// A public key held by the registry: raw material plus its ref count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyEntry {
    material: Vec<u8>,
    ref_count: u32,
}

impl PublicKeyEntry {
    /// Raw key material. Opaque to the registry; never interpreted.
    pub fn material(&self) -> &[u8] {
        &self.material
    }

    /// Number of key sets that include this key.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Short hex fingerprint of the key material, for diagnostics only.
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(&self.material);
        hex::encode(&hash[..8])
    }
}

/// A key set held by the registry: member key ids plus its ref count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySetEntry {
    keys: BTreeSet<PublicKeyId>,
    ref_count: u32,
}

impl KeySetEntry {
    /// The public keys composing this set.
    pub fn keys(&self) -> &BTreeSet<PublicKeyId> {
        &self.keys
    }

    /// Number of live (package, role) bindings pointing at this set.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// Reference-counted registry of key sets and the public keys composing
/// them.
///
/// Mutating operations assume single-threaded ownership: the surrounding
/// package-manager subsystem holds one coarse lock across any call sequence
/// that must appear atomic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySetRegistry {
    public_keys: BTreeMap<PublicKeyId, PublicKeyEntry>,
    key_sets: BTreeMap<KeySetId, KeySetEntry>,
    last_issued_key_id: u64,
    last_issued_key_set_id: u64,
}

impl KeySetRegistry {
    /// Create an empty registry with both counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Allocation ────────────────────────────────────────────────────────────

    /// Add public-key material to the registry, returning its id.
    ///
    /// Identical material is deduplicated: if the material is already
    /// present the existing id is returned and no counter moves. The ref
    /// count is driven by key-set membership, not by this call.
    pub fn add_public_key(&mut self, material: Vec<u8>) -> PublicKeyId {
        if let Some((id, _)) = self
            .public_keys
            .iter()
            .find(|(_, entry)| entry.material == material)
        {
            return *id;
        }

        self.last_issued_key_id += 1;
        let id = PublicKeyId(self.last_issued_key_id);
        self.public_keys.insert(
            id,
            PublicKeyEntry {
                material,
                ref_count: 0,
            },
        );
        id
    }

    /// Allocate a new key set over the given public keys.
    ///
    /// Assigns the next id after `last_issued_key_set_id`, increments each
    /// member key's ref count once, and initializes the set's own ref count
    /// to zero. The caller is responsible for binding the set to a role
    /// (via [`add_ref`](Self::add_ref)) before it becomes live.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::UnknownPublicKey` if any member id is not in
    /// the registry; no state is modified in that case.
    pub fn allocate_key_set(&mut self, keys: BTreeSet<PublicKeyId>) -> Result<KeySetId> {
        for key in &keys {
            if !self.public_keys.contains_key(key) {
                return Err(SettingsError::UnknownPublicKey(*key));
            }
        }

        self.last_issued_key_set_id += 1;
        let id = KeySetId(self.last_issued_key_set_id);

        for key in &keys {
            // Membership is a set, so each key is counted exactly once.
            if let Some(entry) = self.public_keys.get_mut(key) {
                entry.ref_count += 1;
            }
        }

        self.key_sets.insert(
            id,
            KeySetEntry {
                keys,
                ref_count: 0,
            },
        );
        Ok(id)
    }

    // ── Reference counting ────────────────────────────────────────────────────

    /// Record one more (package, role) binding on a key set.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::UnknownKeySet` if the id is not in the
    /// registry.
    pub fn add_ref(&mut self, id: KeySetId) -> Result<()> {
        let entry = self
            .key_sets
            .get_mut(&id)
            .ok_or(SettingsError::UnknownKeySet(id))?;
        entry.ref_count += 1;
        Ok(())
    }

    /// Release one (package, role) binding on a key set.
    ///
    /// A ref count reaching zero removes the set immediately and cascades:
    /// each member key's ref count is decremented and keys reaching zero
    /// are removed from the key table. Ids are never reissued afterwards.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::UnknownKeySet` if the id is not in the
    /// registry.
    pub fn remove_ref(&mut self, id: KeySetId) -> Result<()> {
        let entry = self
            .key_sets
            .get_mut(&id)
            .ok_or(SettingsError::UnknownKeySet(id))?;

        if entry.ref_count == 0 {
            log::warn!("remove_ref on key set {id} that holds no references");
            return Ok(());
        }

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(());
        }

        // Last binding gone: drop the set and release its key references.
        let Some(removed) = self.key_sets.remove(&id) else {
            return Ok(());
        };
        for key in &removed.keys {
            let release = match self.public_keys.get_mut(key) {
                Some(key_entry) => {
                    key_entry.ref_count = key_entry.ref_count.saturating_sub(1);
                    key_entry.ref_count == 0
                }
                None => false,
            };
            if release {
                self.public_keys.remove(key);
            }
        }
        log::debug!("key set {id} released, {} key(s) checked", removed.keys.len());
        Ok(())
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    /// Resolve a key set to the public keys composing it.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::UnknownKeySet` for an unknown id. Under
    /// correct store usage this never happens; it indicates persisted-state
    /// corruption.
    pub fn resolve(&self, id: KeySetId) -> Result<&BTreeSet<PublicKeyId>> {
        self.key_sets
            .get(&id)
            .map(KeySetEntry::keys)
            .ok_or(SettingsError::UnknownKeySet(id))
    }

    /// Return the raw material of a public key.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::UnknownPublicKey` for an unknown id.
    pub fn public_key(&self, id: PublicKeyId) -> Result<&[u8]> {
        self.public_keys
            .get(&id)
            .map(PublicKeyEntry::material)
            .ok_or(SettingsError::UnknownPublicKey(id))
    }

    /// Whether a key set id resolves.
    pub fn contains_key_set(&self, id: KeySetId) -> bool {
        self.key_sets.contains_key(&id)
    }

    /// Ref count of a key set.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::UnknownKeySet` for an unknown id.
    pub fn key_set_ref_count(&self, id: KeySetId) -> Result<u32> {
        self.key_sets
            .get(&id)
            .map(KeySetEntry::ref_count)
            .ok_or(SettingsError::UnknownKeySet(id))
    }

    /// Ref count of a public key.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::UnknownPublicKey` for an unknown id.
    pub fn public_key_ref_count(&self, id: PublicKeyId) -> Result<u32> {
        self.public_keys
            .get(&id)
            .map(PublicKeyEntry::ref_count)
            .ok_or(SettingsError::UnknownPublicKey(id))
    }

    /// Highest public-key id ever issued.
    pub fn last_issued_key_id(&self) -> u64 {
        self.last_issued_key_id
    }

    /// Highest key-set id ever issued.
    pub fn last_issued_key_set_id(&self) -> u64 {
        self.last_issued_key_set_id
    }

    /// Iterate over all public keys, in id order.
    pub fn public_key_entries(&self) -> impl Iterator<Item = (PublicKeyId, &PublicKeyEntry)> {
        self.public_keys.iter().map(|(id, entry)| (*id, entry))
    }

    /// Iterate over all key sets, in id order.
    pub fn key_set_entries(&self) -> impl Iterator<Item = (KeySetId, &KeySetEntry)> {
        self.key_sets.iter().map(|(id, entry)| (*id, entry))
    }

    /// True if the registry holds no keys and no sets.
    pub fn is_empty(&self) -> bool {
        self.public_keys.is_empty() && self.key_sets.is_empty()
    }

    // ── Rebuild from persisted tables ─────────────────────────────────────────

    /// Rebuild a registry from persisted tables.
    ///
    /// Public-key ref counts are re-derived from set membership; key-set
    /// ref counts start at zero and are re-established by the store when it
    /// binds packages, so ref-count conservation holds by construction.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::UnknownPublicKey` if a set references a key
    /// missing from the key table, or `SettingsError::InvalidFileFormat` if
    /// a live id exceeds its counter.
    pub fn from_tables(
        keys: BTreeMap<PublicKeyId, Vec<u8>>,
        sets: BTreeMap<KeySetId, BTreeSet<PublicKeyId>>,
        last_issued_key_id: u64,
        last_issued_key_set_id: u64,
    ) -> Result<Self> {
        if let Some(id) = keys.keys().find(|id| id.0 > last_issued_key_id) {
            return Err(SettingsError::InvalidFileFormat(format!(
                "public key id {id} exceeds lastIssuedKeyId {last_issued_key_id}"
            )));
        }
        if let Some(id) = sets.keys().find(|id| id.0 > last_issued_key_set_id) {
            return Err(SettingsError::InvalidFileFormat(format!(
                "key set id {id} exceeds lastIssuedKeySetId {last_issued_key_set_id}"
            )));
        }

        let mut registry = Self {
            public_keys: keys
                .into_iter()
                .map(|(id, material)| {
                    (
                        id,
                        PublicKeyEntry {
                            material,
                            ref_count: 0,
                        },
                    )
                })
                .collect(),
            key_sets: BTreeMap::new(),
            last_issued_key_id,
            last_issued_key_set_id,
        };

        for (id, members) in sets {
            for key in &members {
                let entry = registry
                    .public_keys
                    .get_mut(key)
                    .ok_or(SettingsError::UnknownPublicKey(*key))?;
                entry.ref_count += 1;
            }
            registry.key_sets.insert(
                id,
                KeySetEntry {
                    keys: members,
                    ref_count: 0,
                },
            );
        }

        Ok(registry)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
