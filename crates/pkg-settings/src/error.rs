//! Error types for pkg-settings.
//!
//! All errors are strongly typed and propagated without panicking.
//! A consistency violation (a dangling key-set or public-key id) is a
//! corruption signal, never a crash.

use crate::keyset::{KeySetId, PublicKeyId};

/// Settings error types covering all store, registry, and storage operations.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Package not found: {0}")]
    PackageNotFound(String),

    #[error("Shared user not found: {0}")]
    SharedUserNotFound(String),

    #[error("Unknown key set: {0}")]
    UnknownKeySet(KeySetId),

    #[error("Unknown public key: {0}")]
    UnknownPublicKey(PublicKeyId),

    #[error("Invalid file format: {0}")]
    InvalidFileFormat(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, SettingsError>;
