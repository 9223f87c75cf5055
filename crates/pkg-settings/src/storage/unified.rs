//! Unified persisted settings format.
//!
//! One versioned JSON document replaces the legacy three-file layout. It
//! round-trips every legacy field plus the full per-user overlay, which the
//! legacy format only supported for a single implicit user.
//!
//! Document shape:
//! ```json
//! {
//!     "version": 1,
//!     "platform": { "internal": 15, "external": 0, "fingerprint": "..." },
//!     "permission_trees": [ ... opaque ... ],
//!     "permissions": [ ... opaque ... ],
//!     "packages": [ { ... PackageSetting ... } ],
//!     "shared_users": [ { ... SharedUserSetting ... } ],
//!     "key_sets": {
//!         "keys": { "1": "<base64 material>" },
//!         "sets": { "1": [1, 2] },
//!         "last_issued_key_id": 3,
//!         "last_issued_key_set_id": 4
//!     }
//! }
//! ```
//!
//! Key-set and public-key ref counts are *not* persisted: they are
//! re-derived on load by re-binding every package, so ref-count
//! conservation holds by construction.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SettingsError};
use crate::keyset::{KeySetId, KeySetRegistry, PublicKeyId};
use crate::settings::{PackageSetting, PlatformVersion, SharedUserSetting};
use crate::storage::atomic;

// ── File format constants ─────────────────────────────────────────────────────

/// File name of the unified document under the store's base directory.
pub const UNIFIED_FILE_NAME: &str = "package-settings.json";

const UNIFIED_VERSION: u32 = 1;

// ── On-disk structures ────────────────────────────────────────────────────────

/// Top-level structure written to disk as the unified settings file.
///
/// Package and shared-user entries are held as raw JSON values so that a
/// single malformed entry can be skipped on load instead of failing the
/// whole document.
#[derive(Debug, Serialize, Deserialize)]
pub struct UnifiedDocument {
    /// Format version number.
    pub version: u32,
    /// Last platform version metadata.
    #[serde(default)]
    pub platform: PlatformVersion,
    /// Permission-tree section; opaque to this core.
    #[serde(default)]
    pub permission_trees: Value,
    /// Permissions section; opaque to this core.
    #[serde(default)]
    pub permissions: Value,
    /// One entry per installed package.
    #[serde(default)]
    pub packages: Vec<Value>,
    /// One entry per shared user.
    #[serde(default)]
    pub shared_users: Vec<Value>,
    /// Public-key table, key-set table, and allocation counters.
    #[serde(default)]
    pub key_sets: KeySetTables,
}

impl UnifiedDocument {
    /// Build a document at the current version from model parts.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::SerializationError` if an entry cannot be
    /// converted to JSON.
    pub fn from_model<'a>(
        platform: PlatformVersion,
        permission_trees: Value,
        permissions: Value,
        packages: impl Iterator<Item = &'a PackageSetting>,
        shared_users: impl Iterator<Item = &'a SharedUserSetting>,
        registry: &KeySetRegistry,
    ) -> Result<Self> {
        let packages = packages
            .map(|ps| {
                serde_json::to_value(ps)
                    .map_err(|e| SettingsError::SerializationError(e.to_string()))
            })
            .collect::<Result<Vec<Value>>>()?;
        let shared_users = shared_users
            .map(|su| {
                serde_json::to_value(su)
                    .map_err(|e| SettingsError::SerializationError(e.to_string()))
            })
            .collect::<Result<Vec<Value>>>()?;

        Ok(Self {
            version: UNIFIED_VERSION,
            platform,
            permission_trees,
            permissions,
            packages,
            shared_users,
            key_sets: KeySetTables::from_registry(registry),
        })
    }

    /// Decode package entries, skipping malformed ones with a diagnostic.
    pub fn decode_packages(&self) -> Vec<PackageSetting> {
        self.packages
            .iter()
            .filter_map(|value| match serde_json::from_value(value.clone()) {
                Ok(ps) => Some(ps),
                Err(e) => {
                    let name = value.get("name").and_then(Value::as_str).unwrap_or("?");
                    log::warn!("skipping malformed package entry {name:?}: {e}");
                    None
                }
            })
            .collect()
    }

    /// Decode shared-user entries, skipping malformed ones with a
    /// diagnostic.
    pub fn decode_shared_users(&self) -> Vec<SharedUserSetting> {
        self.shared_users
            .iter()
            .filter_map(|value| match serde_json::from_value(value.clone()) {
                Ok(su) => Some(su),
                Err(e) => {
                    let name = value.get("name").and_then(Value::as_str).unwrap_or("?");
                    log::warn!("skipping malformed shared-user entry {name:?}: {e}");
                    None
                }
            })
            .collect()
    }
}

/// Persisted form of the key-set registry.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeySetTables {
    /// Public-key table: id → base64 key material.
    #[serde(default)]
    pub keys: BTreeMap<PublicKeyId, String>,
    /// Key-set table: id → member key ids.
    #[serde(default)]
    pub sets: BTreeMap<KeySetId, Vec<PublicKeyId>>,
    /// Monotonic public-key allocation counter.
    #[serde(default)]
    pub last_issued_key_id: u64,
    /// Monotonic key-set allocation counter.
    #[serde(default)]
    pub last_issued_key_set_id: u64,
}

impl KeySetTables {
    /// Snapshot a live registry into its persisted form.
    pub fn from_registry(registry: &KeySetRegistry) -> Self {
        Self {
            keys: registry
                .public_key_entries()
                .map(|(id, entry)| {
                    (
                        id,
                        base64::Engine::encode(
                            &base64::engine::general_purpose::STANDARD,
                            entry.material(),
                        ),
                    )
                })
                .collect(),
            sets: registry
                .key_set_entries()
                .map(|(id, entry)| (id, entry.keys().iter().copied().collect()))
                .collect(),
            last_issued_key_id: registry.last_issued_key_id(),
            last_issued_key_set_id: registry.last_issued_key_set_id(),
        }
    }

    /// Rebuild a registry (with zero key-set ref counts) from the tables.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::InvalidFileFormat` for undecodable key
    /// material or counter violations, and `SettingsError::UnknownPublicKey`
    /// for a set referencing a missing key.
    pub fn into_registry(self) -> Result<KeySetRegistry> {
        let mut keys = BTreeMap::new();
        for (id, material_b64) in self.keys {
            let material = base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                &material_b64,
            )
            .map_err(|e| {
                SettingsError::InvalidFileFormat(format!(
                    "public key {id} has invalid base64 material: {e}"
                ))
            })?;
            keys.insert(id, material);
        }

        let sets: BTreeMap<KeySetId, BTreeSet<PublicKeyId>> = self
            .sets
            .into_iter()
            .map(|(id, members)| (id, members.into_iter().collect()))
            .collect();

        KeySetRegistry::from_tables(
            keys,
            sets,
            self.last_issued_key_id,
            self.last_issued_key_set_id,
        )
    }
}

// ── Read / write ──────────────────────────────────────────────────────────────

/// Read and parse the unified document at `path`.
///
/// # Errors
///
/// Returns `SettingsError::InvalidFileFormat` for malformed content or an
/// unsupported version, or `SettingsError::Io` for filesystem errors.
pub fn read_document(path: &Path) -> Result<UnifiedDocument> {
    let bytes = std::fs::read(path)?;
    let doc: UnifiedDocument = serde_json::from_slice(&bytes).map_err(|e| {
        SettingsError::InvalidFileFormat(format!(
            "failed to parse unified settings {}: {e}",
            path.display()
        ))
    })?;

    if doc.version != UNIFIED_VERSION {
        return Err(SettingsError::InvalidFileFormat(format!(
            "unsupported unified settings version {}",
            doc.version
        )));
    }

    Ok(doc)
}

/// Serialize and durably write the unified document to `path`.
///
/// The write goes through the atomic writer: a failure partway leaves the
/// previous durable file untouched.
///
/// # Errors
///
/// Returns `SettingsError::SerializationError` if serialization fails, or
/// `SettingsError::Io` for filesystem errors.
pub fn write_document(path: &Path, doc: &UnifiedDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| SettingsError::SerializationError(e.to_string()))?;
    atomic::write_atomic(path, json.as_bytes())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
