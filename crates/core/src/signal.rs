/// Completes when the process has been asked to stop: SIGTERM or SIGINT on
/// unix, Ctrl-C elsewhere. A second interrupt exits immediately, so an
/// operator is never stuck behind a slow drain.
pub async fn shutdown_requested() {
	imp::wait().await
}

#[cfg(unix)]
mod imp {
	use std::process;

	use tokio::signal::unix::{SignalKind, signal};
	use tracing::info;

	pub(super) async fn wait() {
		let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
		let mut int = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
		tokio::select! {
			_ = term.recv() => info!("received SIGTERM, starting shutdown"),
			_ = int.recv() => {
				info!("received SIGINT, starting shutdown");
				tokio::spawn(async move {
					int.recv().await;
					info!("second interrupt, exiting immediately");
					process::exit(0);
				});
			},
		}
	}
}

#[cfg(not(unix))]
mod imp {
	use tracing::info;

	pub(super) async fn wait() {
		let _ = tokio::signal::ctrl_c().await;
		info!("received interrupt, starting shutdown");
	}
}
