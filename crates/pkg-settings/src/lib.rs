//! pkg-settings — durable package-metadata store.
//!
//! Keeps the authoritative record of every installed package: identity
//! and paths, signing-key lineage through a reference-counted key-set
//! registry, shared-user membership, and an independent per-user
//! enablement overlay. The whole model persists as one versioned JSON
//! document written atomically; a legacy three-file layout is migrated
//! into it exactly once on first load.

pub mod error;
pub mod keyset;
pub mod settings;
pub mod storage;

// Re-export primary types
pub use error::{Result, SettingsError};
pub use keyset::{KeySetId, KeySetRegistry, PublicKeyId};
pub use settings::{
    EnabledState, PackageKeySetData, PackageSetting, PackageUserState, PlatformVersion,
    SettingsStore, SharedUserSetting, UserId,
};
pub use storage::UNIFIED_FILE_NAME;
