//! Legacy three-file layout — one-time migration input.
//!
//! The older layout kept package metadata in three separate artifacts
//! under the base directory:
//!
//! - `packages.json` — the metadata document: platform version, opaque
//!   permission sections, package entries with signing data, shared-user
//!   entries, and the key-set tables. Field names follow the legacy
//!   convention (`codePath`, `ft`/`it`/`ut` hex timestamps,
//!   `proper-signing-keyset`, `defined-keysets`, `upgrade-keysets`,
//!   `keyset-settings` with `lastIssuedKeyId`/`lastIssuedKeySetId`).
//! - `packages-stopped.json` — `{ "packages": [ { "name", "nl" } ] }`;
//!   packages named here are stopped for the default user, with `nl`
//!   carrying the not-launched flag. Absent packages are not stopped.
//! - `packages.list` — one line per package,
//!   `name uid debug dataPath seinfo`; consumed for uid consistency
//!   checking only and never introduces packages.
//!
//! Malformed or partially specified entries are skipped with a diagnostic;
//! partial migration success is preferred over total failure. The caller
//! persists the unified form once after the merge, superseding these files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde_json::Value;

use crate::error::{Result, SettingsError};
use crate::keyset::{KeySetId, KeySetRegistry, PublicKeyId};
use crate::settings::{
    EnabledState, PackageKeySetData, PackageSetting, PlatformVersion, SharedUserSetting, UserId,
};

// ── File names ────────────────────────────────────────────────────────────────

/// Legacy metadata document under the base directory.
pub const LEGACY_METADATA_FILE: &str = "packages.json";
/// Legacy stopped-packages document under the base directory.
pub const LEGACY_STOPPED_FILE: &str = "packages-stopped.json";
/// Legacy flat installed-package listing under the base directory.
pub const LEGACY_LIST_FILE: &str = "packages.list";

/// Everything the legacy layout yields after the three-file merge.
#[derive(Debug)]
pub struct LegacySnapshot {
    /// Last platform version metadata.
    pub platform: PlatformVersion,
    /// Opaque permission-tree section.
    pub permission_trees: Value,
    /// Opaque permissions section.
    pub permissions: Value,
    /// Successfully migrated package entries.
    pub packages: Vec<PackageSetting>,
    /// Shared-user entries.
    pub shared_users: Vec<SharedUserSetting>,
    /// Key-set registry with zero ref counts; the store re-binds packages.
    pub key_sets: KeySetRegistry,
}

/// Read and merge the legacy layout under `base_dir`.
///
/// Returns `Ok(None)` when the metadata document does not exist (nothing
/// to migrate). Entries that are malformed or reference unknown key sets
/// are skipped with a `log::warn!`; the stopped overlay is applied for
/// `default_user`; the flat listing is cross-checked for uid consistency.
///
/// # Errors
///
/// Returns `SettingsError::InvalidFileFormat` if the metadata document is
/// present but not valid JSON, or `SettingsError::Io` for filesystem
/// errors other than a missing file.
pub fn read_snapshot(base_dir: &Path, default_user: UserId) -> Result<Option<LegacySnapshot>> {
    let meta_path = base_dir.join(LEGACY_METADATA_FILE);
    let bytes = match std::fs::read(&meta_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let root: Value = serde_json::from_slice(&bytes).map_err(|e| {
        SettingsError::InvalidFileFormat(format!(
            "failed to parse legacy metadata {}: {e}",
            meta_path.display()
        ))
    })?;
    let root = root.as_object().ok_or_else(|| {
        SettingsError::InvalidFileFormat("legacy metadata root is not an object".to_string())
    })?;

    // The key-set tables come first; package entries resolve against them.
    let key_sets = parse_key_set_settings(root.get("keyset-settings"));

    let (shared_users, uid_to_shared) = parse_shared_users(root.get("shared-users"));

    let mut packages: Vec<PackageSetting> = Vec::new();
    if let Some(entries) = root.get("packages").and_then(Value::as_array) {
        for entry in entries {
            let Some(ps) = parse_package(entry, &key_sets, &uid_to_shared, default_user) else {
                continue;
            };
            if packages.iter().any(|existing| existing.name == ps.name) {
                log::warn!("skipping duplicate legacy package entry {:?}", ps.name);
                continue;
            }
            packages.push(ps);
        }
    }

    apply_stopped_overlay(base_dir, &mut packages, default_user)?;

    let shared_uids: BTreeMap<String, u32> = shared_users
        .iter()
        .map(|su| (su.name.clone(), su.uid))
        .collect();
    cross_check_listing(base_dir, &packages, &shared_uids)?;

    log::debug!(
        "legacy migration read {} package(s), {} shared user(s)",
        packages.len(),
        shared_users.len()
    );

    Ok(Some(LegacySnapshot {
        platform: parse_platform(root.get("last-platform-version")),
        permission_trees: root.get("permission-trees").cloned().unwrap_or(Value::Null),
        permissions: root.get("permissions").cloned().unwrap_or(Value::Null),
        packages,
        shared_users,
        key_sets,
    }))
}

// ── Metadata document sections ────────────────────────────────────────────────

fn parse_platform(value: Option<&Value>) -> PlatformVersion {
    let Some(obj) = value.and_then(Value::as_object) else {
        return PlatformVersion::default();
    };
    PlatformVersion {
        internal: u64_field(obj, "internal").unwrap_or(0) as u32,
        external: u64_field(obj, "external").unwrap_or(0) as u32,
        fingerprint: str_field(obj, "fingerprint").unwrap_or_default().to_string(),
    }
}

/// Parse the `keyset-settings` block into a registry with zero ref counts.
///
/// Undecodable keys are dropped, and any set referencing a dropped or
/// missing key is dropped with it. Counters that undercount live ids are
/// raised so the monotonic-identifier invariant holds.
fn parse_key_set_settings(value: Option<&Value>) -> KeySetRegistry {
    let Some(obj) = value.and_then(Value::as_object) else {
        return KeySetRegistry::new();
    };

    let mut keys: BTreeMap<PublicKeyId, Vec<u8>> = BTreeMap::new();
    if let Some(table) = obj.get("keys").and_then(Value::as_object) {
        for (id_str, material) in table {
            let Ok(id) = id_str.parse::<u64>() else {
                log::warn!("skipping public key with non-numeric id {id_str:?}");
                continue;
            };
            let Some(material_b64) = material.as_str() else {
                log::warn!("skipping public key {id}: material is not a string");
                continue;
            };
            match base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                material_b64,
            ) {
                Ok(decoded) => {
                    keys.insert(PublicKeyId(id), decoded);
                }
                Err(e) => log::warn!("skipping public key {id}: invalid base64: {e}"),
            }
        }
    }

    let mut sets: BTreeMap<KeySetId, BTreeSet<PublicKeyId>> = BTreeMap::new();
    if let Some(table) = obj.get("keysets").and_then(Value::as_object) {
        for (id_str, members) in table {
            let Ok(id) = id_str.parse::<u64>() else {
                log::warn!("skipping key set with non-numeric id {id_str:?}");
                continue;
            };
            let Some(member_ids) = numeric_array(members) else {
                log::warn!("skipping key set {id}: members are not a numeric array");
                continue;
            };
            let member_keys: BTreeSet<PublicKeyId> =
                member_ids.into_iter().map(PublicKeyId).collect();
            if let Some(missing) = member_keys.iter().find(|k| !keys.contains_key(k)) {
                log::warn!("skipping key set {id}: references unknown public key {missing}");
                continue;
            }
            sets.insert(KeySetId(id), member_keys);
        }
    }

    let max_key = keys.keys().map(|k| k.0).max().unwrap_or(0);
    let max_set = sets.keys().map(|s| s.0).max().unwrap_or(0);
    let mut last_key = u64_field(obj, "lastIssuedKeyId").unwrap_or(0);
    let mut last_set = u64_field(obj, "lastIssuedKeySetId").unwrap_or(0);
    if last_key < max_key {
        log::warn!("lastIssuedKeyId {last_key} undercounts live ids; raising to {max_key}");
        last_key = max_key;
    }
    if last_set < max_set {
        log::warn!("lastIssuedKeySetId {last_set} undercounts live ids; raising to {max_set}");
        last_set = max_set;
    }

    match KeySetRegistry::from_tables(keys, sets, last_key, last_set) {
        Ok(registry) => registry,
        // Unreachable after the filtering above, but corruption must not
        // abort the migration.
        Err(e) => {
            log::warn!("discarding legacy key-set tables: {e}");
            KeySetRegistry::new()
        }
    }
}

fn parse_shared_users(
    value: Option<&Value>,
) -> (Vec<SharedUserSetting>, BTreeMap<u32, String>) {
    let mut shared_users = Vec::new();
    let mut uid_to_name = BTreeMap::new();

    let Some(entries) = value.and_then(Value::as_array) else {
        return (shared_users, uid_to_name);
    };

    for entry in entries {
        let Some(obj) = entry.as_object() else {
            log::warn!("skipping non-object shared-user entry");
            continue;
        };
        let Some(name) = str_field(obj, "name") else {
            log::warn!("skipping shared-user entry without a name");
            continue;
        };
        let Some(uid) = u64_field(obj, "userId") else {
            log::warn!("skipping shared user {name:?}: missing userId");
            continue;
        };

        let permissions: BTreeSet<String> = obj
            .get("perms")
            .and_then(Value::as_array)
            .map(|perms| {
                perms
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        uid_to_name.insert(uid as u32, name.to_string());
        shared_users.push(SharedUserSetting {
            name: name.to_string(),
            uid: uid as u32,
            signatures: parse_signatures(obj),
            permissions,
        });
    }

    (shared_users, uid_to_name)
}

/// Parse one legacy package entry. Returns `None` (after a diagnostic) for
/// malformed entries and for consistency violations such as a dangling
/// key-set reference.
fn parse_package(
    value: &Value,
    registry: &KeySetRegistry,
    uid_to_shared: &BTreeMap<u32, String>,
    default_user: UserId,
) -> Option<PackageSetting> {
    let Some(obj) = value.as_object() else {
        log::warn!("skipping non-object package entry");
        return None;
    };
    let Some(name) = str_field(obj, "name") else {
        log::warn!("skipping package entry without a name");
        return None;
    };
    let Some(code_path) = str_field(obj, "codePath") else {
        log::warn!("skipping package {name:?}: missing codePath");
        return None;
    };
    let Some(version) = u64_field(obj, "version") else {
        log::warn!("skipping package {name:?}: missing version");
        return None;
    };

    let code_mod_time = hex_time(obj, "ft", name)?;
    let first_install_time = hex_time(obj, "it", name)?;
    let last_update_time = hex_time(obj, "ut", name)?;

    // Signing lineage, resolved against the key-set tables.
    let Some(proper) = u64_field(obj, "proper-signing-keyset").map(KeySetId) else {
        log::warn!("skipping package {name:?}: missing proper-signing-keyset");
        return None;
    };
    if !registry.contains_key_set(proper) {
        log::warn!("skipping package {name:?}: proper signing key set {proper} is unknown");
        return None;
    }

    let mut key_set_data = PackageKeySetData::new(proper);
    if let Some(defined) = obj.get("defined-keysets").and_then(Value::as_object) {
        for (alias, id_value) in defined {
            let Some(id) = id_value.as_u64().map(KeySetId) else {
                log::warn!("skipping package {name:?}: alias {alias:?} is not numeric");
                return None;
            };
            if !registry.contains_key_set(id) {
                log::warn!("skipping package {name:?}: alias {alias:?} references unknown key set {id}");
                return None;
            }
            key_set_data.aliases.insert(alias.clone(), id);
        }
    }
    if let Some(upgrade) = obj.get("upgrade-keysets") {
        let Some(ids) = numeric_array(upgrade) else {
            log::warn!("skipping package {name:?}: upgrade-keysets is not a numeric array");
            return None;
        };
        for id in ids.into_iter().map(KeySetId) {
            if !registry.contains_key_set(id) {
                log::warn!("skipping package {name:?}: upgrade key set {id} is unknown");
                return None;
            }
            key_set_data.upgrade_key_sets.push(id);
        }
    }

    let mut ps = PackageSetting::new(name, code_path, version as u32, key_set_data);
    ps.native_library_path = str_field(obj, "nativeLibraryPath")
        .unwrap_or_default()
        .to_string();
    ps.flags = u64_field(obj, "flags").unwrap_or(0) as u32;
    ps.code_mod_time = code_mod_time;
    ps.first_install_time = first_install_time;
    ps.last_update_time = last_update_time;
    ps.signatures = parse_signatures(obj);

    // Ownership: either a shared uid (resolved to the shared-user name) or
    // the package's own uid.
    if let Some(shared_uid) = u64_field(obj, "sharedUserId") {
        match uid_to_shared.get(&(shared_uid as u32)) {
            Some(shared_name) => ps.shared_user = Some(shared_name.clone()),
            None => {
                log::warn!(
                    "package {:?} references unknown shared uid {shared_uid}; keeping uid directly",
                    ps.name
                );
                ps.app_id = Some(shared_uid as u32);
            }
        }
    } else if let Some(uid) = u64_field(obj, "userId") {
        ps.app_id = Some(uid as u32);
    }

    // The legacy format tracked enablement for a single implicit user.
    if let Some(enabled) = obj.get("enabled") {
        let state = enabled.as_u64().and_then(EnabledState::from_raw);
        let Some(state) = state else {
            log::warn!("skipping package {:?}: invalid enabled override", ps.name);
            return None;
        };
        if state != EnabledState::Default {
            ps.set_enabled(state, default_user);
        }
    }

    Some(ps)
}

fn parse_signatures(obj: &serde_json::Map<String, Value>) -> Vec<String> {
    obj.get("sigs")
        .and_then(Value::as_array)
        .map(|sigs| {
            sigs.iter()
                .filter_map(|cert| cert.get("key").and_then(Value::as_str))
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ── Stopped overlay ───────────────────────────────────────────────────────────

fn apply_stopped_overlay(
    base_dir: &Path,
    packages: &mut [PackageSetting],
    default_user: UserId,
) -> Result<()> {
    let path = base_dir.join(LEGACY_STOPPED_FILE);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let root: Value = match serde_json::from_slice(&bytes) {
        Ok(root) => root,
        Err(e) => {
            log::warn!("ignoring malformed stopped-packages document: {e}");
            return Ok(());
        }
    };

    let Some(entries) = root.get("packages").and_then(Value::as_array) else {
        log::warn!("stopped-packages document has no package list");
        return Ok(());
    };

    for entry in entries {
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            log::warn!("skipping stopped-packages entry without a name");
            continue;
        };
        let not_launched = entry
            .get("nl")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        match packages.iter_mut().find(|ps| ps.name == name) {
            Some(ps) => {
                ps.set_stopped(true, default_user);
                ps.set_not_launched(not_launched, default_user);
            }
            None => log::warn!("stopped-packages names unknown package {name:?}"),
        }
    }

    Ok(())
}

// ── Flat listing cross-check ──────────────────────────────────────────────────

/// Cross-check `packages.list` uids against the merged model. Mismatches
/// are diagnosed but never drop packages; the listing introduces nothing.
fn cross_check_listing(
    base_dir: &Path,
    packages: &[PackageSetting],
    shared_uids: &BTreeMap<String, u32>,
) -> Result<()> {
    let path = base_dir.join(LEGACY_LIST_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            log::warn!("packages.list line {} is malformed", lineno + 1);
            continue;
        }
        let name = fields[0];
        let Ok(listed_uid) = fields[1].parse::<u32>() else {
            log::warn!("packages.list line {} has a non-numeric uid", lineno + 1);
            continue;
        };

        let Some(ps) = packages.iter().find(|ps| ps.name == name) else {
            log::warn!("packages.list names unknown package {name:?}");
            continue;
        };
        let model_uid = ps
            .app_id
            .or_else(|| ps.shared_user.as_deref().and_then(|su| shared_uids.get(su).copied()));
        match model_uid {
            Some(uid) if uid != listed_uid => log::warn!(
                "uid mismatch for {name:?}: listing says {listed_uid}, metadata says {uid}"
            ),
            Some(_) => {}
            None => log::warn!("package {name:?} has no uid to check against the listing"),
        }
    }

    Ok(())
}

// ── Value helpers ─────────────────────────────────────────────────────────────

fn str_field<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn u64_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<u64> {
    obj.get(key).and_then(Value::as_u64)
}

fn numeric_array(value: &Value) -> Option<Vec<u64>> {
    let array = value.as_array()?;
    array.iter().map(Value::as_u64).collect()
}

/// Legacy timestamps are hex-encoded epoch milliseconds. Absent reads as
/// zero; malformed skips the entry.
fn hex_time(obj: &serde_json::Map<String, Value>, key: &str, name: &str) -> Option<u64> {
    match obj.get(key) {
        None => Some(0),
        Some(Value::String(s)) => match u64::from_str_radix(s, 16) {
            Ok(millis) => Some(millis),
            Err(e) => {
                log::warn!("skipping package {name:?}: bad hex timestamp {key}={s:?}: {e}");
                None
            }
        },
        Some(_) => {
            log::warn!("skipping package {name:?}: timestamp {key} is not a string");
            None
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
