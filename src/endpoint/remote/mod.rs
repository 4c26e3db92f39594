//! Remote endpoint (spec §4.4): the symmetric client/server pair that
//! reproduces the [`Endpoint`](crate::endpoint::Endpoint) contract over a
//! single reliable byte stream.
//!
//! `wire` defines the framed request/response shapes both halves share;
//! `client` drives the protocol from the dialing side; `server` drives a
//! [`LocalEndpoint`](crate::endpoint::local::LocalEndpoint) from whatever
//! transport `dial`'s remote-scheme handler (or a standalone `serve`
//! command) spawned.

pub mod client;
pub mod server;
pub mod wire;

pub use client::RemoteEndpointClient;
pub use server::serve;

// vim: ts=4
