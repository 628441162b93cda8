//! Utility Functions
//!
//! Buffer primitives, scratch storage, and logging shared across the
//! pipeline.

mod bytes;
mod logging;
mod scratch;

pub use self::bytes::{ByteReader, ByteWriter};
pub use logging::*;
pub use scratch::{with_scratch, with_scratch_f32};

use std::path::PathBuf;

/// Get the application data directory
pub fn get_app_data_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("farview-streamer")
}
