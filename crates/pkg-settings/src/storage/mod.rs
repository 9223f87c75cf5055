//! Durable storage for package settings.
//!
//! Three layers: [`atomic`] writes bytes so a crash never exposes a
//! partial file, [`unified`] defines the single versioned document the
//! store reads and writes, and [`legacy`] migrates the superseded
//! three-file layout into the unified model exactly once.

pub mod atomic;
pub mod legacy;
pub mod unified;

pub use atomic::write_atomic;
pub use legacy::{
    LegacySnapshot, LEGACY_LIST_FILE, LEGACY_METADATA_FILE, LEGACY_STOPPED_FILE,
};
pub use unified::{UnifiedDocument, UNIFIED_FILE_NAME};
