use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter. Safe to call more than once (tests).
pub fn setup_logging() {
	if INITIALIZED.swap(true, Ordering::SeqCst) {
		return;
	}
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::registry()
		.with(filter)
		.with(
			tracing_subscriber::fmt::layer()
				.with_target(true)
				.with_writer(std::io::stderr),
		)
		.init();
}
