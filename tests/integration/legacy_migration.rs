//! Integration test: one-time migration of the legacy three-file layout.
//!
//! Builds the full legacy fixture on disk — metadata document, stopped
//! overlay, flat listing — loads it through the store, and checks the
//! merged model: signing lineage, ref counts, shared-user resolution,
//! per-user flags, and the unified file that supersedes the layout.

use std::collections::BTreeSet;

use pkg_settings::storage::{
    LEGACY_LIST_FILE, LEGACY_METADATA_FILE, LEGACY_STOPPED_FILE, UNIFIED_FILE_NAME,
};
use pkg_settings::{EnabledState, KeySetId, PublicKeyId, SettingsStore};
use serde_json::{json, Value};

fn b64(data: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, data)
}

/// The legacy metadata document: three packages, one shared user, three
/// public keys and four key sets.
///
/// - `com.google.app1` signs with set 1 and runs under the shared uid.
/// - `com.google.app2` signs with set 1 and defines alias `AB` → set 4.
/// - `com.android.app3` signs with set 2, defines alias `C` → set 3, and
///   accepts set 3 for upgrades.
fn metadata_doc() -> Value {
    json!({
        "last-platform-version": { "internal": 15, "external": 0, "fingerprint": "foo" },
        "permission-trees": [ { "name": "com.google.perm-tree", "package": "com.google.app1" } ],
        "permissions": [ { "name": "com.google.perm", "package": "com.google.app1" } ],
        "shared-users": [
            { "name": "com.google.shared", "userId": 11000, "perms": ["android.permission.INTERNET"] }
        ],
        "packages": [
            {
                "name": "com.google.app1",
                "codePath": "/system/app/app1.apk",
                "nativeLibraryPath": "/data/data/com.google.app1/lib",
                "flags": 1,
                "ft": "1360e2caa70",
                "it": "135f2f80d08",
                "ut": "1360e2caa70",
                "version": 1109,
                "sharedUserId": 11000,
                "proper-signing-keyset": 1,
                "sigs": [ { "key": "deadbeef01" } ]
            },
            {
                "name": "com.google.app2",
                "codePath": "/system/app/app2.apk",
                "nativeLibraryPath": "/data/data/com.google.app2/lib",
                "flags": 1,
                "ft": "1360e578718",
                "it": "135f2f77b07",
                "ut": "1360e578718",
                "version": 15,
                "enabled": 3,
                "userId": 11001,
                "proper-signing-keyset": 1,
                "defined-keysets": { "AB": 4 },
                "sigs": [ { "key": "deadbeef01" } ]
            },
            {
                "name": "com.android.app3",
                "codePath": "/system/app/app3.apk",
                "nativeLibraryPath": "/data/data/com.android.app3/lib",
                "flags": 1,
                "ft": "1360e577e80",
                "it": "135f2f876d4",
                "ut": "1360e577e80",
                "version": 15,
                "userId": 11030,
                "proper-signing-keyset": 2,
                "defined-keysets": { "C": 3 },
                "upgrade-keysets": [3],
                "sigs": [ { "key": "deadbeef02" } ]
            }
        ],
        "keyset-settings": {
            "keys": {
                "1": b64(b"key-material-1"),
                "2": b64(b"key-material-2"),
                "3": b64(b"key-material-3")
            },
            "keysets": {
                "1": [1],
                "2": [2],
                "3": [3],
                "4": [1, 2]
            },
            "lastIssuedKeyId": 3,
            "lastIssuedKeySetId": 4
        }
    })
}

fn stopped_doc() -> Value {
    json!({
        "packages": [
            { "name": "com.google.app1", "nl": true },
            { "name": "com.android.app3", "nl": true }
        ]
    })
}

const LISTING: &str = "\
com.google.app1 11000 0 /data/data/com.google.app1 platform
com.google.app2 11001 0 /data/data/com.google.app2 default
com.android.app3 11030 0 /data/data/com.android.app3 default
";

fn write_legacy_fixture(dir: &std::path::Path) {
    std::fs::write(
        dir.join(LEGACY_METADATA_FILE),
        serde_json::to_vec_pretty(&metadata_doc()).unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.join(LEGACY_STOPPED_FILE),
        serde_json::to_vec_pretty(&stopped_doc()).unwrap(),
    )
    .unwrap();
    std::fs::write(dir.join(LEGACY_LIST_FILE), LISTING).unwrap();
}

#[test]
fn migration_merges_all_three_files() {
    let tmp = tempfile::tempdir().unwrap();
    write_legacy_fixture(tmp.path());

    let mut store = SettingsStore::new(tmp.path());
    assert!(store.load(&[0]).unwrap());
    assert_eq!(store.package_count(), 3);

    // ── Platform metadata ───────────────────────────────────────────────
    assert_eq!(store.platform().internal, 15);
    assert_eq!(store.platform().fingerprint, "foo");

    // ── Shared-user resolution ──────────────────────────────────────────
    let app1 = store.package("com.google.app1").unwrap();
    assert_eq!(app1.shared_user.as_deref(), Some("com.google.shared"));
    assert_eq!(app1.app_id, None);
    assert_eq!(store.shared_user("com.google.shared").unwrap().uid, 11000);

    let app2 = store.package("com.google.app2").unwrap();
    assert_eq!(app2.app_id, Some(11001));
    assert_eq!(app2.shared_user, None);

    // ── Timestamps and identity fields ──────────────────────────────────
    assert_eq!(app1.code_mod_time, 0x1360e2caa70);
    assert_eq!(app1.first_install_time, 0x135f2f80d08);
    assert_eq!(app1.version, 1109);
    assert_eq!(app1.signatures, vec!["deadbeef01".to_string()]);

    // ── Signing lineage ─────────────────────────────────────────────────
    assert_eq!(app2.key_set_data.proper_signing_key_set, KeySetId(1));
    assert_eq!(app2.key_set_data.aliases.get("AB"), Some(&KeySetId(4)));

    let app3 = store.package("com.android.app3").unwrap();
    assert_eq!(app3.key_set_data.proper_signing_key_set, KeySetId(2));
    assert_eq!(app3.key_set_data.aliases.get("C"), Some(&KeySetId(3)));
    assert_eq!(app3.key_set_data.upgrade_key_sets, vec![KeySetId(3)]);

    // ── Stopped overlay, default user only ──────────────────────────────
    assert!(app1.stopped(0));
    assert!(app1.not_launched(0));
    assert!(!app1.stopped(1));
    assert!(!app2.stopped(0));
    assert!(app3.stopped(0));

    // ── Enabled override, default user only ─────────────────────────────
    assert_eq!(app2.enabled(0), EnabledState::DisabledUser);
    assert_eq!(app2.enabled(1), EnabledState::Default);
    assert_eq!(app1.enabled(0), EnabledState::Default);
}

#[test]
fn migration_rebinds_reference_counts() {
    let tmp = tempfile::tempdir().unwrap();
    write_legacy_fixture(tmp.path());

    let mut store = SettingsStore::new(tmp.path());
    store.load(&[0]).unwrap();
    let registry = store.key_sets();

    // Set 1 signs app1 and app2; set 4 is app2's alias target; set 2 signs
    // app3 and set 3 is its alias target. The upgrade role on set 3 is
    // covered by the alias binding and adds nothing.
    assert_eq!(registry.key_set_ref_count(KeySetId(1)).unwrap(), 2);
    assert_eq!(registry.key_set_ref_count(KeySetId(2)).unwrap(), 1);
    assert_eq!(registry.key_set_ref_count(KeySetId(3)).unwrap(), 1);
    assert_eq!(registry.key_set_ref_count(KeySetId(4)).unwrap(), 1);

    // Public-key counts follow set membership.
    assert_eq!(registry.public_key_ref_count(PublicKeyId(1)).unwrap(), 2);
    assert_eq!(registry.public_key_ref_count(PublicKeyId(2)).unwrap(), 2);
    assert_eq!(registry.public_key_ref_count(PublicKeyId(3)).unwrap(), 1);

    // Allocation counters survive the migration exactly.
    assert_eq!(registry.last_issued_key_id(), 3);
    assert_eq!(registry.last_issued_key_set_id(), 4);
}

#[test]
fn migration_establishes_the_unified_file() {
    let tmp = tempfile::tempdir().unwrap();
    write_legacy_fixture(tmp.path());

    let mut store = SettingsStore::new(tmp.path());
    store.load(&[0]).unwrap();

    let unified = tmp.path().join(UNIFIED_FILE_NAME);
    assert!(unified.exists(), "migration must persist the unified form");

    // The unified file now answers loads on its own; remove the legacy
    // files and the model must come back unchanged.
    std::fs::remove_file(tmp.path().join(LEGACY_METADATA_FILE)).unwrap();
    std::fs::remove_file(tmp.path().join(LEGACY_STOPPED_FILE)).unwrap();
    std::fs::remove_file(tmp.path().join(LEGACY_LIST_FILE)).unwrap();

    let mut reloaded = SettingsStore::new(tmp.path());
    assert!(reloaded.load(&[0]).unwrap());
    assert_eq!(reloaded.package_count(), 3);

    let app2 = reloaded.package("com.google.app2").unwrap();
    assert_eq!(app2.enabled(0), EnabledState::DisabledUser);
    assert_eq!(app2.key_set_data.aliases.get("AB"), Some(&KeySetId(4)));
    assert!(reloaded.package("com.google.app1").unwrap().stopped(0));

    assert_eq!(
        reloaded.key_sets().key_set_ref_count(KeySetId(1)).unwrap(),
        2
    );
    assert_eq!(reloaded.key_sets().last_issued_key_set_id(), 4);
    assert_eq!(reloaded.platform().fingerprint, "foo");

    // The opaque permission sections pass through migration and the
    // unified round trip byte-for-byte equal to the legacy input.
    assert_eq!(reloaded.permission_trees(), &metadata_doc()["permission-trees"]);
    assert_eq!(reloaded.permissions(), &metadata_doc()["permissions"]);
}

#[test]
fn migration_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    write_legacy_fixture(tmp.path());

    let mut store = SettingsStore::new(tmp.path());
    store.load(&[0]).unwrap();
    let first: BTreeSet<String> = store.packages().map(|ps| ps.name.clone()).collect();
    let first_counts: Vec<u32> = (1..=4)
        .map(|id| store.key_sets().key_set_ref_count(KeySetId(id)).unwrap())
        .collect();

    // A second load from the same directory (unified file now present)
    // reproduces the same observable model.
    store.load(&[0]).unwrap();
    let second: BTreeSet<String> = store.packages().map(|ps| ps.name.clone()).collect();
    let second_counts: Vec<u32> = (1..=4)
        .map(|id| store.key_sets().key_set_ref_count(KeySetId(id)).unwrap())
        .collect();

    assert_eq!(first, second);
    assert_eq!(first_counts, second_counts);
}

#[test]
fn malformed_entries_do_not_abort_migration() {
    let tmp = tempfile::tempdir().unwrap();
    let mut doc = metadata_doc();
    doc["packages"].as_array_mut().unwrap().push(json!({
        "name": "com.broken.app",
        "proper-signing-keyset": 1
    }));
    doc["packages"].as_array_mut().unwrap().push(json!({
        "name": "com.dangling.app",
        "codePath": "/system/app/dangling.apk",
        "version": 1,
        "proper-signing-keyset": 99
    }));
    std::fs::write(
        tmp.path().join(LEGACY_METADATA_FILE),
        serde_json::to_vec_pretty(&doc).unwrap(),
    )
    .unwrap();

    let mut store = SettingsStore::new(tmp.path());
    assert!(store.load(&[0]).unwrap());
    assert_eq!(store.package_count(), 3);
    assert!(store.package("com.broken.app").is_none());
    assert!(store.package("com.dangling.app").is_none());
}

#[test]
fn empty_directory_loads_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = SettingsStore::new(tmp.path());
    assert!(!store.load(&[0]).unwrap());
    assert_eq!(store.package_count(), 0);
    assert!(store.key_sets().is_empty());
}
