//! Workspace umbrella crate.
//!
//! Exposes feature flags that map to the individual workspace crates
//! (`core-service`, `core-match`, `core-sync`). Host applications can depend on
//! `tunesync-workspace` and enable the documented features without wiring each
//! crate individually.

#[cfg(feature = "service")]
pub use core_service as service;

#[cfg(feature = "matching")]
pub use core_match as matching;

#[cfg(feature = "sync")]
pub use core_sync as sync;
