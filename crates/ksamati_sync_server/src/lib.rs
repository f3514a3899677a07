//! # KSAMATI Sync Server
//!
//! Reference central store for KSAMATI offline sync.
//!
//! This crate provides:
//! - A central store holding the authoritative version of every entity
//! - A change feed that devices pull from, skipping their own changes
//! - Version-checked, idempotent push
//!
//! # Protocol
//!
//! Devices sync pull-then-push:
//! 1. Pull changes made by other devices since the last cursor
//! 2. Push pending entries; each is `Applied` or answered with the
//!    server's current state as a `Conflict`
//! 3. Resubmitting an entry already applied returns the original result
//!
//! The server never resolves conflicts. Devices decide and resubmit with
//! `Force`, optionally carrying a merged document.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod central;
mod config;
mod error;
mod handler;
mod server;

pub use central::{CentralStore, EntityState};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{DeviceSession, HandlerContext, RequestHandler};
pub use server::SyncServer;
