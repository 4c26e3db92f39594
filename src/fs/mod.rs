//! Filesystem-sync primitives consumed, but not re-specified, by the core
//! (spec §1: "the core *consumes* their contracts (§6) but the algorithms
//! inside them are not re-specified here").
//!
//! Each submodule is a narrow, concrete implementation of one external
//! collaborator: [`entry`] defines the shared tree shape, [`cache`] the
//! per-endpoint scan accelerator, [`ignore`] pattern matching, [`scan`] the
//! directory walk, [`reconcile`] the three-way merge, and [`transition`]
//! applying changes on disk and folding them into an in-memory ancestor.

pub mod cache;
pub mod entry;
pub mod ignore;
pub mod reconcile;
pub mod scan;
pub mod transition;

// vim: ts=4
