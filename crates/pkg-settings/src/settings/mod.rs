//! Package settings — per-package records and the durable store.
//!
//! [`package`] holds the data model: one [`PackageSetting`] per installed
//! package, with signing-key lineage and an independent per-user overlay.
//! [`store`] owns the full in-memory model and its load/persist lifecycle.

pub mod package;
pub mod store;

pub use package::{
    EnabledState, PackageKeySetData, PackageSetting, PackageUserState, SharedUserSetting, UserId,
};
pub use store::{PlatformVersion, SettingsStore};
