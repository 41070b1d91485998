//! Packaging core: manifest assembly, partial-manifest discovery and the
//! restricted-API scan of compiled classes.

pub mod assemble;
pub mod classfile;
pub mod classpath;
pub mod config;
pub mod discover;
pub mod errors;
pub mod policy;
pub mod report;
pub mod scan;
pub mod version;

pub use errors::{PackError, Result};

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
