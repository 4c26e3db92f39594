//! `duosync`: a continuous, bidirectional file synchronization session
//! engine (spec §1 OVERVIEW). A [`manager::Manager`] owns a registry of
//! [`controller::Controller`]s, each driving one session's connect/scan/
//! reconcile/stage/transition cycle between two [`endpoint::Endpoint`]s —
//! a local filesystem or a remote peer reached through [`dial`].
//!
//! This crate is the synchronization core only (spec §1 Non-goals): it has
//! no CLI, no daemon process model, and no transport beyond the built-in
//! `ssh` [`dial::Handler`]. Binaries embedding it are expected to own
//! argument parsing, the per-user [`paths::Paths`] root, and process
//! lifecycle, and to drive a [`manager::Manager`] the way this crate's own
//! tests do.

pub mod cancel;
pub mod config;
pub mod controller;
pub mod dial;
pub mod endpoint;
pub mod error;
pub mod fs;
pub mod logging;
pub mod manager;
pub mod paths;
pub mod session;
pub mod stager;
pub mod tracker;
pub mod transfer;

pub use config::Configuration;
pub use controller::{Controller, ControllerStateSnapshot, HaltMode, Status};
pub use error::{Result, SyncError};
pub use manager::{Manager, Selection};
pub use paths::Paths;
pub use session::{Side, SessionRecord};

// vim: ts=4
