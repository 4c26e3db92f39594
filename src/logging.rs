//! Logging prelude for the synchronization core.
//!
//! Thin re-export of the `tracing` macros plus a single subscriber
//! initializer, in the spirit of the teacher's own `logging.rs`: callers
//! embedding this crate in a daemon decide how to wire `tracing`, but a
//! default initializer is provided for standalone use and tests.

pub use tracing::{debug, error, info, trace, warn};

/// Initialize a `tracing` subscriber reading `RUST_LOG` (defaulting to
/// `info`), writing to stderr. Safe to call more than once; subsequent
/// calls are ignored by `tracing_subscriber`'s global dispatcher guard.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.try_init();
}

// vim: ts=4
