//! The durable package settings store.
//!
//! Owns the full in-memory model: per-package records, shared users, the
//! key-set registry, and the platform/permission metadata carried through
//! load and persist. Construction is explicit (base directory plus the set
//! of known users at load time) and teardown is a final
//! [`persist`](SettingsStore::persist); there is no ambient global state.
//!
//! # Concurrency
//!
//! The store is built for single-writer, multi-reader access under one
//! coarse-grained lock owned by the caller (the surrounding package-manager
//! subsystem). Every mutating operation carries the precondition that the
//! caller holds that lock across any call sequence that must appear
//! atomic; the store itself is a plain value with no internal locking.
//! Load and persist are synchronous local computation plus file I/O; there
//! is no cancellation concept, they complete or fail outright.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SettingsError};
use crate::keyset::{KeySetId, KeySetRegistry, PublicKeyId};
use crate::settings::package::{
    EnabledState, PackageSetting, SharedUserSetting, UserId,
};
use crate::storage::legacy::{self, LegacySnapshot};
use crate::storage::unified::{self, UnifiedDocument};

/// Last platform version metadata, carried through load and persist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformVersion {
    /// Internal platform version code.
    #[serde(default)]
    pub internal: u32,
    /// External platform version code.
    #[serde(default)]
    pub external: u32,
    /// Build fingerprint the settings were last written under.
    #[serde(default)]
    pub fingerprint: String,
}

/// The package settings store.
pub struct SettingsStore {
    base_dir: PathBuf,
    packages: BTreeMap<String, PackageSetting>,
    shared_users: BTreeMap<String, SharedUserSetting>,
    key_sets: KeySetRegistry,
    platform: PlatformVersion,
    permission_trees: Value,
    permissions: Value,
}

impl SettingsStore {
    /// Create an empty store rooted at `base_dir`. No file I/O happens
    /// until [`load`](Self::load) or [`persist`](Self::persist).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            packages: BTreeMap::new(),
            shared_users: BTreeMap::new(),
            key_sets: KeySetRegistry::new(),
            platform: PlatformVersion::default(),
            permission_trees: Value::Null,
            permissions: Value::Null,
        }
    }

    /// The directory this store reads from and writes to.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn unified_path(&self) -> PathBuf {
        self.base_dir.join(unified::UNIFIED_FILE_NAME)
    }

    // ── Load / persist ────────────────────────────────────────────────────────

    /// Load the model from disk, preferring the unified format.
    ///
    /// If the unified file is absent or unparsable the legacy migrator runs
    /// exactly once: it merges the three legacy files and the resulting
    /// model is immediately persisted in unified form, superseding them.
    /// Returns whether any data was established. Calling again from a
    /// clean state reproduces the same observable model.
    ///
    /// `known_users` selects the default user for the legacy stopped
    /// overlay and prunes overlays of users no longer on the device; pass
    /// every currently known user id.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::Io` for filesystem errors other than absent
    /// files. Parse failures are not errors: they fall back or produce an
    /// empty store, always with a diagnostic.
    pub fn load(&mut self, known_users: &[UserId]) -> Result<bool> {
        self.clear();

        let unified_path = self.unified_path();
        match unified::read_document(&unified_path) {
            Ok(doc) => {
                self.absorb_unified(doc, known_users);
                return Ok(true);
            }
            Err(SettingsError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no unified settings at {}", unified_path.display());
            }
            Err(SettingsError::Io(e)) => return Err(e.into()),
            Err(e) => {
                log::warn!("unified settings unreadable ({e}); falling back to legacy layout");
            }
        }

        let default_user = known_users.first().copied().unwrap_or(0);
        match legacy::read_snapshot(&self.base_dir, default_user) {
            Ok(Some(snapshot)) => {
                self.absorb_legacy(snapshot);
                // Establish the unified form as the canonical source of
                // truth; the legacy files are superseded, not rewritten.
                self.persist()?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e @ SettingsError::Io(_)) => Err(e),
            Err(e) => {
                log::warn!("legacy migration failed ({e}); starting from an empty store");
                Ok(false)
            }
        }
    }

    /// Serialize the full model and write it durably.
    ///
    /// Safe with respect to crash-in-progress: the atomic writer guarantees
    /// a failed persist leaves the previous durable file intact. The
    /// failure is surfaced to the caller, who decides whether to retry.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::SerializationError` or `SettingsError::Io`.
    pub fn persist(&self) -> Result<()> {
        let doc = UnifiedDocument::from_model(
            self.platform.clone(),
            self.permission_trees.clone(),
            self.permissions.clone(),
            self.packages.values(),
            self.shared_users.values(),
            &self.key_sets,
        )?;
        unified::write_document(&self.unified_path(), &doc)
    }

    fn clear(&mut self) {
        self.packages.clear();
        self.shared_users.clear();
        self.key_sets = KeySetRegistry::new();
        self.platform = PlatformVersion::default();
        self.permission_trees = Value::Null;
        self.permissions = Value::Null;
    }

    fn absorb_unified(&mut self, doc: UnifiedDocument, known_users: &[UserId]) {
        let packages = doc.decode_packages();
        let shared_users = doc.decode_shared_users();

        self.platform = doc.platform;
        self.permission_trees = doc.permission_trees;
        self.permissions = doc.permissions;
        self.key_sets = match doc.key_sets.into_registry() {
            Ok(registry) => registry,
            Err(e) => {
                log::warn!("discarding corrupt key-set tables: {e}");
                KeySetRegistry::new()
            }
        };

        for su in shared_users {
            self.shared_users.insert(su.name.clone(), su);
        }
        for mut ps in packages {
            if !known_users.is_empty() {
                ps.retain_users(known_users);
            }
            let name = ps.name.clone();
            if let Err(e) = self.insert_package(ps) {
                log::warn!("dropping package {name:?} with corrupt signing data: {e}");
            }
        }
    }

    fn absorb_legacy(&mut self, snapshot: LegacySnapshot) {
        self.platform = snapshot.platform;
        self.permission_trees = snapshot.permission_trees;
        self.permissions = snapshot.permissions;
        self.key_sets = snapshot.key_sets;

        for su in snapshot.shared_users {
            self.shared_users.insert(su.name.clone(), su);
        }
        for ps in snapshot.packages {
            let name = ps.name.clone();
            if let Err(e) = self.insert_package(ps) {
                log::warn!("dropping migrated package {name:?}: {e}");
            }
        }
    }

    // ── Package lookup ────────────────────────────────────────────────────────

    /// Look up a package. Pure read; an absent package is `None`, never a
    /// fabricated record.
    pub fn package(&self, name: &str) -> Option<&PackageSetting> {
        self.packages.get(name)
    }

    /// Mutable access to a package record.
    ///
    /// Precondition: the caller holds the external settings lock. Signing
    /// lineage must not be edited through this handle; key-set bindings
    /// are only adjusted by [`insert_package`](Self::insert_package),
    /// [`remove_package`](Self::remove_package), and
    /// [`rotate_signing_key_set`](Self::rotate_signing_key_set).
    pub fn package_mut(&mut self, name: &str) -> Option<&mut PackageSetting> {
        self.packages.get_mut(name)
    }

    /// Iterate all packages in name order.
    pub fn packages(&self) -> impl Iterator<Item = &PackageSetting> {
        self.packages.values()
    }

    /// Number of packages in the store.
    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    /// Look up a shared-user entry.
    pub fn shared_user(&self, name: &str) -> Option<&SharedUserSetting> {
        self.shared_users.get(name)
    }

    /// Iterate all shared users in name order.
    pub fn shared_users(&self) -> impl Iterator<Item = &SharedUserSetting> {
        self.shared_users.values()
    }

    /// The key-set registry backing this store.
    pub fn key_sets(&self) -> &KeySetRegistry {
        &self.key_sets
    }

    /// Mutable access to the key-set registry, for allocating keys and
    /// sets ahead of an [`insert_package`](Self::insert_package) or
    /// [`rotate_signing_key_set`](Self::rotate_signing_key_set) call.
    ///
    /// Precondition: the caller holds the external settings lock.
    pub fn key_sets_mut(&mut self) -> &mut KeySetRegistry {
        &mut self.key_sets
    }

    /// Last platform version metadata.
    pub fn platform(&self) -> &PlatformVersion {
        &self.platform
    }

    /// Opaque permission-tree section, carried through load and persist
    /// untouched.
    pub fn permission_trees(&self) -> &Value {
        &self.permission_trees
    }

    /// Opaque permissions section, carried through load and persist
    /// untouched.
    pub fn permissions(&self) -> &Value {
        &self.permissions
    }

    // ── Package lifecycle ─────────────────────────────────────────────────────

    /// Insert (or replace) a package record, binding its key-set roles.
    ///
    /// Takes one registry reference for the proper signing set and each
    /// distinct alias target, after validating that every referenced key
    /// set — upgrade sets included — resolves. Replacing an existing record
    /// releases the old bindings after the new ones are taken, so shared
    /// key sets never dip to zero in between.
    ///
    /// Precondition: the caller holds the external settings lock.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::UnknownKeySet` for a dangling reference; no
    /// state changes in that case.
    pub fn insert_package(&mut self, setting: PackageSetting) -> Result<()> {
        let targets = setting.key_set_data.referenced_key_sets();
        for id in &targets {
            if !self.key_sets.contains_key_set(*id) {
                return Err(SettingsError::UnknownKeySet(*id));
            }
        }
        for id in &setting.key_set_data.upgrade_key_sets {
            if !self.key_sets.contains_key_set(*id) {
                return Err(SettingsError::UnknownKeySet(*id));
            }
        }

        for id in &targets {
            self.key_sets.add_ref(*id)?;
        }
        if let Some(previous) = self.packages.insert(setting.name.clone(), setting) {
            self.release_bindings(&previous);
        }
        Ok(())
    }

    /// Remove a package, releasing exactly the key-set bindings it held.
    /// Sets and keys whose ref count reaches zero are cleaned up by the
    /// registry.
    ///
    /// Precondition: the caller holds the external settings lock.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::PackageNotFound` if the package is absent.
    pub fn remove_package(&mut self, name: &str) -> Result<PackageSetting> {
        let setting = self
            .packages
            .remove(name)
            .ok_or_else(|| SettingsError::PackageNotFound(name.to_string()))?;
        self.release_bindings(&setting);
        Ok(setting)
    }

    /// Rotate a package's proper signing key set to a freshly allocated
    /// set over `keys`, returning the new set's id. The old set's
    /// reference is released; if that was its last binding it is removed
    /// and its public keys cascade.
    ///
    /// Precondition: the caller holds the external settings lock.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::PackageNotFound` for an unknown package or
    /// `SettingsError::UnknownPublicKey` for an unregistered key id.
    pub fn rotate_signing_key_set(
        &mut self,
        name: &str,
        keys: BTreeSet<PublicKeyId>,
    ) -> Result<KeySetId> {
        if !self.packages.contains_key(name) {
            return Err(SettingsError::PackageNotFound(name.to_string()));
        }
        let new_id = self.key_sets.allocate_key_set(keys)?;

        let (old_targets, new_targets) = {
            let Some(ps) = self.packages.get_mut(name) else {
                return Err(SettingsError::PackageNotFound(name.to_string()));
            };
            let old = ps.key_set_data.referenced_key_sets();
            ps.key_set_data.proper_signing_key_set = new_id;
            (old, ps.key_set_data.referenced_key_sets())
        };

        for id in new_targets.difference(&old_targets) {
            self.key_sets.add_ref(*id)?;
        }
        for id in old_targets.difference(&new_targets) {
            if let Err(e) = self.key_sets.remove_ref(*id) {
                log::warn!("releasing rotated key set {id} failed: {e}");
            }
        }
        Ok(new_id)
    }

    fn release_bindings(&mut self, setting: &PackageSetting) {
        for id in setting.key_set_data.referenced_key_sets() {
            if let Err(e) = self.key_sets.remove_ref(id) {
                log::warn!(
                    "releasing key set {id} for package {:?} failed: {e}",
                    setting.name
                );
            }
        }
    }

    // ── Per-user mutations ────────────────────────────────────────────────────

    /// Set the enablement state for one (package, user) pair. No effect on
    /// any other user's overlay.
    ///
    /// Precondition: the caller holds the external settings lock.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::PackageNotFound` if the package is absent.
    pub fn set_enabled(&mut self, name: &str, user: UserId, state: EnabledState) -> Result<()> {
        self.package_entry_mut(name)?.set_enabled(state, user);
        Ok(())
    }

    /// Replace (not merge) the disabled-component set for one
    /// (package, user) pair.
    ///
    /// Precondition: the caller holds the external settings lock.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::PackageNotFound` if the package is absent.
    pub fn set_disabled_components(
        &mut self,
        name: &str,
        user: UserId,
        components: BTreeSet<String>,
    ) -> Result<()> {
        self.package_entry_mut(name)?
            .set_disabled_components(components, user);
        Ok(())
    }

    /// Replace (not merge) the enabled-component set for one
    /// (package, user) pair.
    ///
    /// Precondition: the caller holds the external settings lock.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::PackageNotFound` if the package is absent.
    pub fn set_enabled_components(
        &mut self,
        name: &str,
        user: UserId,
        components: BTreeSet<String>,
    ) -> Result<()> {
        self.package_entry_mut(name)?
            .set_enabled_components(components, user);
        Ok(())
    }

    /// Set the stopped flag for one (package, user) pair.
    ///
    /// Precondition: the caller holds the external settings lock.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::PackageNotFound` if the package is absent.
    pub fn set_stopped(&mut self, name: &str, user: UserId, stopped: bool) -> Result<()> {
        self.package_entry_mut(name)?.set_stopped(stopped, user);
        Ok(())
    }

    /// Set the not-launched flag for one (package, user) pair.
    ///
    /// Precondition: the caller holds the external settings lock.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::PackageNotFound` if the package is absent.
    pub fn set_not_launched(&mut self, name: &str, user: UserId, not_launched: bool) -> Result<()> {
        self.package_entry_mut(name)?
            .set_not_launched(not_launched, user);
        Ok(())
    }

    /// Insert (or replace) a shared-user entry.
    ///
    /// Precondition: the caller holds the external settings lock.
    pub fn insert_shared_user(&mut self, setting: SharedUserSetting) {
        self.shared_users.insert(setting.name.clone(), setting);
    }

    fn package_entry_mut(&mut self, name: &str) -> Result<&mut PackageSetting> {
        self.packages
            .get_mut(name)
            .ok_or_else(|| SettingsError::PackageNotFound(name.to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
