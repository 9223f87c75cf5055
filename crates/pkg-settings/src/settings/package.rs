//! Per-package settings records.
//!
//! A [`PackageSetting`] is created on first observation of a package (fresh
//! install or migration), mutated over the package's installed lifetime,
//! and removed on uninstall. The per-user overlay is tracked independently
//! per device user: user 0's state never implicitly affects user 1's.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::keyset::KeySetId;

/// Device user identifier.
pub type UserId = u32;

/// Enablement state of a package (or component) for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnabledState {
    /// No explicit override; the package's manifest default applies.
    #[default]
    Default,
    /// Explicitly enabled.
    Enabled,
    /// Explicitly disabled by a management action.
    Disabled,
    /// Disabled by the user themselves.
    DisabledUser,
}

impl EnabledState {
    /// Decode the numeric value used by the legacy format.
    pub fn from_raw(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Default),
            1 => Some(Self::Enabled),
            2 => Some(Self::Disabled),
            3 => Some(Self::DisabledUser),
            _ => None,
        }
    }

    /// The numeric value used by the legacy format.
    pub fn as_raw(self) -> u64 {
        match self {
            Self::Default => 0,
            Self::Enabled => 1,
            Self::Disabled => 2,
            Self::DisabledUser => 3,
        }
    }
}

/// The per-user overlay for one (package, user) pair.
///
/// An absent overlay reads as this type's `Default`: enablement follows the
/// manifest, the package is launched and not stopped, and both component
/// sets are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUserState {
    /// Enablement override for this user.
    #[serde(default)]
    pub enabled: EnabledState,
    /// The package has never been launched by this user.
    #[serde(default)]
    pub not_launched: bool,
    /// The package is in the stopped state for this user.
    #[serde(default)]
    pub stopped: bool,
    /// Component names explicitly disabled for this user.
    #[serde(default)]
    pub disabled_components: BTreeSet<String>,
    /// Component names explicitly enabled for this user.
    #[serde(default)]
    pub enabled_components: BTreeSet<String>,
}

/// Signing lineage of one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageKeySetData {
    /// The key set that currently signs this package.
    pub proper_signing_key_set: KeySetId,
    /// Named key-set capabilities this package declares, alias → key set.
    #[serde(default)]
    pub aliases: BTreeMap<String, KeySetId>,
    /// Key sets whose signature authorizes an in-place upgrade even though
    /// it differs from the proper signing key set. Order is meaningful.
    #[serde(default)]
    pub upgrade_key_sets: Vec<KeySetId>,
}

impl PackageKeySetData {
    /// Lineage with only a proper signing key set.
    pub fn new(proper_signing_key_set: KeySetId) -> Self {
        Self {
            proper_signing_key_set,
            aliases: BTreeMap::new(),
            upgrade_key_sets: Vec::new(),
        }
    }

    /// The key sets this package holds a registry reference on: the proper
    /// signing set plus every defined alias target, counted once each.
    ///
    /// Upgrade key sets are always among the package's defined sets, so
    /// they carry no reference of their own; they are only validated to
    /// resolve.
    pub fn referenced_key_sets(&self) -> BTreeSet<KeySetId> {
        let mut targets: BTreeSet<KeySetId> = self.aliases.values().copied().collect();
        targets.insert(self.proper_signing_key_set);
        targets
    }
}

/// Everything the store persists about one installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSetting {
    /// Package name; unique key in the store.
    pub name: String,
    /// Installed code location.
    pub code_path: String,
    /// Native library location.
    #[serde(default)]
    pub native_library_path: String,
    /// Installed version code.
    pub version: u32,
    /// Numeric flags bitmask; opaque to this core.
    #[serde(default)]
    pub flags: u32,
    /// Code modification timestamp, epoch milliseconds.
    #[serde(default)]
    pub code_mod_time: u64,
    /// First install timestamp, epoch milliseconds.
    #[serde(default)]
    pub first_install_time: u64,
    /// Last update timestamp, epoch milliseconds.
    #[serde(default)]
    pub last_update_time: u64,
    /// Per-package uid, when the package does not share one.
    #[serde(default)]
    pub app_id: Option<u32>,
    /// Name of the shared-user entry this package runs as, if any. The
    /// shared user owns the uid in that case.
    #[serde(default)]
    pub shared_user: Option<String>,
    /// Opaque hex certificate blobs; round-tripped, never interpreted.
    #[serde(default)]
    pub signatures: Vec<String>,
    /// Signing-key lineage.
    pub key_set_data: PackageKeySetData,
    /// Per-user overlays; absent users read as default.
    #[serde(default)]
    user_states: BTreeMap<UserId, PackageUserState>,
}

impl PackageSetting {
    /// Create a setting with the required identity fields; everything else
    /// starts at its default.
    pub fn new(
        name: impl Into<String>,
        code_path: impl Into<String>,
        version: u32,
        key_set_data: PackageKeySetData,
    ) -> Self {
        Self {
            name: name.into(),
            code_path: code_path.into(),
            native_library_path: String::new(),
            version,
            flags: 0,
            code_mod_time: 0,
            first_install_time: 0,
            last_update_time: 0,
            app_id: None,
            shared_user: None,
            signatures: Vec::new(),
            key_set_data,
            user_states: BTreeMap::new(),
        }
    }

    // ── Per-user overlay ──────────────────────────────────────────────────────

    /// Enablement state observed by `user`.
    pub fn enabled(&self, user: UserId) -> EnabledState {
        self.user_state(user).map_or_else(Default::default, |s| s.enabled)
    }

    /// Set the enablement state for `user` only.
    pub fn set_enabled(&mut self, state: EnabledState, user: UserId) {
        self.user_state_mut(user).enabled = state;
    }

    /// Whether the package is stopped for `user`.
    pub fn stopped(&self, user: UserId) -> bool {
        self.user_state(user).is_some_and(|s| s.stopped)
    }

    /// Set the stopped flag for `user` only.
    pub fn set_stopped(&mut self, stopped: bool, user: UserId) {
        self.user_state_mut(user).stopped = stopped;
    }

    /// Whether the package has never been launched by `user`.
    pub fn not_launched(&self, user: UserId) -> bool {
        self.user_state(user).is_some_and(|s| s.not_launched)
    }

    /// Set the not-launched flag for `user` only.
    pub fn set_not_launched(&mut self, not_launched: bool, user: UserId) {
        self.user_state_mut(user).not_launched = not_launched;
    }

    /// Components explicitly disabled for `user`.
    pub fn disabled_components(&self, user: UserId) -> &BTreeSet<String> {
        const EMPTY: &BTreeSet<String> = &BTreeSet::new();
        self.user_state(user)
            .map_or(EMPTY, |s| &s.disabled_components)
    }

    /// Replace (not merge) the disabled-component set for `user`.
    pub fn set_disabled_components(&mut self, components: BTreeSet<String>, user: UserId) {
        self.user_state_mut(user).disabled_components = components;
    }

    /// Components explicitly enabled for `user`.
    pub fn enabled_components(&self, user: UserId) -> &BTreeSet<String> {
        const EMPTY: &BTreeSet<String> = &BTreeSet::new();
        self.user_state(user)
            .map_or(EMPTY, |s| &s.enabled_components)
    }

    /// Replace (not merge) the enabled-component set for `user`.
    pub fn set_enabled_components(&mut self, components: BTreeSet<String>, user: UserId) {
        self.user_state_mut(user).enabled_components = components;
    }

    /// The stored overlay for `user`, if one exists.
    pub fn user_state(&self, user: UserId) -> Option<&PackageUserState> {
        self.user_states.get(&user)
    }

    /// The overlay for `user`, created at its default if absent.
    pub fn user_state_mut(&mut self, user: UserId) -> &mut PackageUserState {
        self.user_states.entry(user).or_default()
    }

    /// All stored overlays, keyed by user.
    pub fn user_states(&self) -> &BTreeMap<UserId, PackageUserState> {
        &self.user_states
    }

    /// Drop overlays for users not in `known_users`.
    pub(crate) fn retain_users(&mut self, known_users: &[UserId]) {
        self.user_states
            .retain(|user, _| known_users.contains(user));
    }
}

/// A shared-user entry: several packages running under one uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedUserSetting {
    /// Shared-user name; unique key.
    pub name: String,
    /// The uid owned by this shared user.
    pub uid: u32,
    /// Opaque hex certificate blobs.
    #[serde(default)]
    pub signatures: Vec<String>,
    /// Granted permission names; opaque to this core.
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
