//! Platform integration for Petrel.
//!
//! Resolves per-platform application directories and provides the
//! JSON-file-backed key/value store used for small persisted state
//! (device id, pending installer markers, settings overrides).

mod paths;
mod store;

pub use paths::{AppPaths, AppPathsError};
pub use store::JsonStore;

/// Short platform code substituted into remote-config paths and update
/// feed query strings.
#[must_use]
pub fn platform_short_code() -> &'static str {
    if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else {
        "linux"
    }
}
