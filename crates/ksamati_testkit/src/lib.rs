//! # KSAMATI Testkit
//!
//! Test utilities for KSAMATI offline sync.
//!
//! This crate provides:
//! - Store fixtures (in-memory and temporary directories)
//! - Property-based test generators using proptest
//! - Crash simulation for journal recovery tests
//! - An in-process central store for end-to-end sync tests
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ksamati_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_store() {
//!     with_temp_store(|store| {
//!         append_changes(store, &DeviceId::new("tablet"), 3);
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
    pub use ksamati_sync_protocol::{DeviceId, NewChange};
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
