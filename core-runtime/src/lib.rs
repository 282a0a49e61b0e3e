//! # Core Runtime
//!
//! Ambient infrastructure shared by every engine crate:
//! - Configuration structs with defaults and validation
//! - Logging and tracing initialisation
//! - Event bus for fire-and-forget notifications
//!
//! ## Overview
//!
//! Nothing in here knows about matching or checkpoints. Component crates take
//! their slice of [`config::CoreConfig`] and an optional [`events::EventBus`]
//! handle, and log through `tracing`; [`logging::init_logging`] decides where
//! that output goes.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
