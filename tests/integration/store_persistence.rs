//! Integration test: programmatic store lifecycle.
//!
//! Builds a model through the store's own API — register keys, allocate
//! sets, insert packages, edit per-user overlays — persists it, and
//! checks that a fresh store reads back the same observable model.

use std::collections::BTreeSet;

use pkg_settings::{
    EnabledState, KeySetId, PackageKeySetData, PackageSetting, SettingsError, SettingsStore,
    SharedUserSetting,
};

/// Registers two keys, allocates a set over each, and installs two
/// packages: `com.example.alpha` on set 1, `com.example.beta` on set 2
/// with an alias back to set 1.
fn build_model(store: &mut SettingsStore) -> (KeySetId, KeySetId) {
    let k1 = store.key_sets_mut().add_public_key(b"alpha-key".to_vec());
    let k2 = store.key_sets_mut().add_public_key(b"beta-key".to_vec());
    let s1 = store
        .key_sets_mut()
        .allocate_key_set([k1].into_iter().collect())
        .unwrap();
    let s2 = store
        .key_sets_mut()
        .allocate_key_set([k2].into_iter().collect())
        .unwrap();

    let alpha = PackageSetting::new(
        "com.example.alpha",
        "/data/app/alpha.apk",
        3,
        PackageKeySetData::new(s1),
    );
    store.insert_package(alpha).unwrap();

    let mut beta_lineage = PackageKeySetData::new(s2);
    beta_lineage.aliases.insert("legacy".to_string(), s1);
    let mut beta = PackageSetting::new("com.example.beta", "/data/app/beta.apk", 7, beta_lineage);
    beta.shared_user = Some("com.example.shared".to_string());
    store.insert_package(beta).unwrap();

    store.insert_shared_user(SharedUserSetting {
        name: "com.example.shared".to_string(),
        uid: 10077,
        signatures: Vec::new(),
        permissions: ["android.permission.INTERNET".to_string()]
            .into_iter()
            .collect(),
    });

    (s1, s2)
}

#[test]
fn persist_and_reload_round_trips_the_model() {
    let tmp = tempfile::tempdir().unwrap();

    let mut store = SettingsStore::new(tmp.path());
    let (s1, s2) = build_model(&mut store);
    store
        .set_enabled("com.example.alpha", 0, EnabledState::Disabled)
        .unwrap();
    store.set_stopped("com.example.beta", 1, true).unwrap();
    store.persist().unwrap();

    let mut reloaded = SettingsStore::new(tmp.path());
    assert!(reloaded.load(&[0, 1]).unwrap());
    assert_eq!(reloaded.package_count(), 2);

    let alpha = reloaded.package("com.example.alpha").unwrap();
    assert_eq!(alpha.version, 3);
    assert_eq!(alpha.enabled(0), EnabledState::Disabled);
    assert_eq!(alpha.enabled(1), EnabledState::Default);

    let beta = reloaded.package("com.example.beta").unwrap();
    assert_eq!(beta.key_set_data.aliases.get("legacy"), Some(&s1));
    assert!(beta.stopped(1));
    assert!(!beta.stopped(0));
    assert_eq!(beta.shared_user.as_deref(), Some("com.example.shared"));
    assert_eq!(reloaded.shared_user("com.example.shared").unwrap().uid, 10077);

    // Ref counts are re-derived, not read back: set 1 is alpha's signer
    // plus beta's alias target, set 2 signs beta alone.
    assert_eq!(reloaded.key_sets().key_set_ref_count(s1).unwrap(), 2);
    assert_eq!(reloaded.key_sets().key_set_ref_count(s2).unwrap(), 1);
    assert_eq!(reloaded.key_sets().last_issued_key_set_id(), 2);
}

#[test]
fn component_overlays_are_per_user_and_replace() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = SettingsStore::new(tmp.path());
    build_model(&mut store);

    let components: BTreeSet<String> = ["com.example.alpha/.Component1".to_string()]
        .into_iter()
        .collect();
    store
        .set_disabled_components("com.example.alpha", 0, components.clone())
        .unwrap();
    store
        .set_enabled_components("com.example.alpha", 1, components)
        .unwrap();

    store.persist().unwrap();
    let mut reloaded = SettingsStore::new(tmp.path());
    reloaded.load(&[0, 1]).unwrap();

    let alpha = reloaded.package("com.example.alpha").unwrap();
    assert!(alpha
        .disabled_components(0)
        .contains("com.example.alpha/.Component1"));
    assert!(alpha.disabled_components(1).is_empty());
    assert!(alpha.enabled_components(0).is_empty());
    assert!(alpha
        .enabled_components(1)
        .contains("com.example.alpha/.Component1"));

    // A later write replaces the set wholesale.
    let narrower: BTreeSet<String> = ["com.example.alpha/.Component2".to_string()]
        .into_iter()
        .collect();
    reloaded
        .set_disabled_components("com.example.alpha", 0, narrower)
        .unwrap();
    let alpha = reloaded.package("com.example.alpha").unwrap();
    assert_eq!(alpha.disabled_components(0).len(), 1);
    assert!(alpha
        .disabled_components(0)
        .contains("com.example.alpha/.Component2"));
}

#[test]
fn removing_packages_conserves_ref_counts_across_persist() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = SettingsStore::new(tmp.path());
    let (s1, s2) = build_model(&mut store);

    // Dropping beta releases its signer (set 2 dies with it) but set 1
    // keeps alpha's reference.
    store.remove_package("com.example.beta").unwrap();
    assert!(!store.key_sets().contains_key_set(s2));
    assert_eq!(store.key_sets().key_set_ref_count(s1).unwrap(), 1);

    store.persist().unwrap();
    let mut reloaded = SettingsStore::new(tmp.path());
    reloaded.load(&[0]).unwrap();

    assert_eq!(reloaded.package_count(), 1);
    assert!(!reloaded.key_sets().contains_key_set(s2));
    assert_eq!(reloaded.key_sets().key_set_ref_count(s1).unwrap(), 1);
    // Counters never rewind, so the dead set's id stays burned.
    assert_eq!(reloaded.key_sets().last_issued_key_set_id(), 2);
}

#[test]
fn rotation_survives_persist_and_reload() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = SettingsStore::new(tmp.path());
    let (s1, _) = build_model(&mut store);

    let fresh_key = store.key_sets_mut().add_public_key(b"rotated-key".to_vec());
    let rotated = store
        .rotate_signing_key_set("com.example.alpha", [fresh_key].into_iter().collect())
        .unwrap();
    assert_ne!(rotated, s1);
    // Set 1 survives through beta's alias even though alpha moved off it.
    assert_eq!(store.key_sets().key_set_ref_count(s1).unwrap(), 1);

    store.persist().unwrap();
    let mut reloaded = SettingsStore::new(tmp.path());
    reloaded.load(&[0]).unwrap();

    let alpha = reloaded.package("com.example.alpha").unwrap();
    assert_eq!(alpha.key_set_data.proper_signing_key_set, rotated);
    assert_eq!(reloaded.key_sets().key_set_ref_count(rotated).unwrap(), 1);
}

#[test]
fn unknown_packages_surface_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = SettingsStore::new(tmp.path());
    build_model(&mut store);

    assert!(matches!(
        store.set_enabled("com.example.ghost", 0, EnabledState::Enabled),
        Err(SettingsError::PackageNotFound(_))
    ));
    assert!(matches!(
        store.rotate_signing_key_set("com.example.ghost", BTreeSet::new()),
        Err(SettingsError::PackageNotFound(_))
    ));
    assert!(store.package("com.example.ghost").is_none());
}

#[test]
fn load_prunes_overlays_of_removed_users() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = SettingsStore::new(tmp.path());
    build_model(&mut store);
    store
        .set_enabled("com.example.alpha", 7, EnabledState::Disabled)
        .unwrap();
    store
        .set_enabled("com.example.alpha", 0, EnabledState::Enabled)
        .unwrap();
    store.persist().unwrap();

    // User 7 no longer exists at the next load; its overlay is dropped.
    let mut reloaded = SettingsStore::new(tmp.path());
    reloaded.load(&[0, 1]).unwrap();
    let alpha = reloaded.package("com.example.alpha").unwrap();
    assert_eq!(alpha.enabled(0), EnabledState::Enabled);
    assert_eq!(alpha.enabled(7), EnabledState::Default);
    assert!(alpha.user_state(7).is_none());
}
