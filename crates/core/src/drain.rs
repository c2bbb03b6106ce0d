use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, info, warn};

/// Constructs a new pair for draining.
/// * DrainTrigger starts a drain and waits for it to complete.
/// * DrainWatcher is held by anything that wants to participate in draining.
///   It can be cloned; a drain does not complete until every outstanding
///   watcher is dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(None);
	let (blocked_tx, blocked_rx) = mpsc::channel(1);
	(
		DrainTrigger {
			blocked_rx,
			signal_tx,
		},
		DrainWatcher {
			blocked_tx,
			signal_rx,
		},
	)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
	/// Terminate without waiting on in-flight work.
	Immediate,
	/// Refuse new work, let in-flight work finish.
	Graceful,
}

enum Never {}

/// Starts a drain and observes its completion.
pub struct DrainTrigger {
	blocked_rx: mpsc::Receiver<Never>,
	signal_tx: watch::Sender<Option<DrainMode>>,
}

impl DrainTrigger {
	/// Signals all watchers to drain, then waits until every watcher (and
	/// every [`DrainBlocker`] handed out by `wait_for_drain`) is dropped.
	pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
		let _ = self.signal_tx.send(Some(mode));
		match self.blocked_rx.recv().await {
			None => {},
			Some(n) => match n {},
		}
	}
}

/// Watches for a drain signal while keeping the process alive.
#[derive(Clone)]
pub struct DrainWatcher {
	blocked_tx: mpsc::Sender<Never>,
	signal_rx: watch::Receiver<Option<DrainMode>>,
}

/// A weak watcher observes the signal but does not block drain completion.
/// Accept loops hold one of these so that listening forever does not wedge
/// shutdown, while each accepted connection is upgraded to a strong watcher.
#[derive(Clone)]
pub struct WeakDrainWatcher {
	signal_rx: watch::Receiver<Option<DrainMode>>,
}

pub struct DrainUpgrader {
	blocked_tx: Option<mpsc::Sender<Never>>,
}

impl DrainUpgrader {
	/// Stop minting strong watchers; after this, upgrades no longer block drain.
	pub fn disable(&mut self) {
		self.blocked_tx = None;
	}

	pub fn upgrade(&self, weak: WeakDrainWatcher) -> DrainWatcher {
		let blocked_tx = self.blocked_tx.clone().unwrap_or_else(|| {
			let (tx, _) = mpsc::channel(1);
			tx
		});
		DrainWatcher {
			blocked_tx,
			signal_rx: weak.signal_rx,
		}
	}
}

/// Held after a drain has been observed; dropping it releases the trigger.
#[must_use = "dropping the blocker releases the drain"]
pub struct DrainBlocker(#[allow(dead_code)] mpsc::Sender<Never>, DrainMode);

impl DrainBlocker {
	pub fn mode(&self) -> DrainMode {
		self.1
	}
}

impl DrainWatcher {
	pub fn into_weak(self) -> (DrainUpgrader, WeakDrainWatcher) {
		let DrainWatcher {
			blocked_tx,
			signal_rx,
		} = self;
		(
			DrainUpgrader {
				blocked_tx: Some(blocked_tx),
			},
			WeakDrainWatcher { signal_rx },
		)
	}

	/// Completes once a drain has been signaled, returning a blocker that must
	/// be dropped when the local shutdown work is done.
	pub async fn wait_for_drain(mut self) -> DrainBlocker {
		let mode = self
			.signal_rx
			.wait_for(Option::is_some)
			.await
			.map(|mode| mode.expect("guarded by wait_for"))
			// Trigger dropped entirely: nothing to wait for.
			.unwrap_or(DrainMode::Immediate);
		DrainBlocker(self.blocked_tx, mode)
	}

	/// Wrap a hyper connection so a drain starts its graceful shutdown
	/// (GOAWAY on h2, `Connection: close` on h1) while letting it finish.
	pub fn wrap_connection<C>(self, conn: C) -> impl Future<Output = C::Output>
	where
		C: hyper_util::server::graceful::GracefulConnection,
	{
		graceful::Wrapped::new(conn, self.wait_for_drain())
	}
}

/// Runs `make_future` with layered shutdown: on drain, the inner drain is
/// signaled and the future gets `deadline` to finish before `force_shutdown`
/// fires and remaining work must abort.
pub async fn run_with_drain<F, O>(
	component: String,
	drain: DrainWatcher,
	deadline: Duration,
	make_future: F,
) where
	F: AsyncFnOnce(DrainWatcher, watch::Receiver<()>) -> O,
	O: Send + 'static,
{
	let (sub_trigger, sub_drain) = new();
	let (force_tx, force_rx) = watch::channel(());
	let force_tx_fut = force_tx.clone();
	let fut = make_future(sub_drain, force_rx).in_current_span();
	let watch = async move {
		let blocker = drain.wait_for_drain().await;
		if blocker.mode() == DrainMode::Graceful {
			info!(component, "drain started, allowing {deadline:?} for in-flight work");
			if tokio::time::timeout(
				deadline,
				sub_trigger.start_drain_and_wait(DrainMode::Graceful),
			)
			.await
			.is_err()
			{
				warn!(component, "drain deadline expired with pending work, forcing shutdown");
			}
		} else {
			debug!(component, "terminating");
		}
		let _ = force_tx.send(());
		info!(component, "shutdown complete");
	};
	tokio::select! {
		_ = fut => {
			let _ = force_tx_fut.send(());
		},
		_ = watch => {}
	}
}

mod graceful {
	use std::pin::Pin;
	use std::task::{Context, Poll};

	use hyper_util::server::graceful::GracefulConnection;
	use pin_project_lite::pin_project;

	pin_project! {
		pub struct Wrapped<C, F: Future> {
			#[pin]
			conn: C,
			#[pin]
			cancel: F,
			// Held until the connection completes so the drain stays blocked.
			#[pin]
			guard: Option<F::Output>,
		}
	}

	impl<C, F: Future> Wrapped<C, F> {
		pub fn new(conn: C, cancel: F) -> Self {
			Self {
				conn,
				cancel,
				guard: None,
			}
		}
	}

	impl<C, F> Future for Wrapped<C, F>
	where
		C: GracefulConnection,
		F: Future,
	{
		type Output = C::Output;

		fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
			let mut this = self.project();
			if this.guard.is_none()
				&& let Poll::Ready(g) = this.cancel.poll(cx)
			{
				this.guard.set(Some(g));
				this.conn.as_mut().graceful_shutdown();
			}
			this.conn.poll(cx)
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn drain_waits_for_watchers() {
		let (trigger, watcher) = new();
		let held = watcher.clone();
		let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
		tokio::spawn(async move {
			let blocker = held.wait_for_drain().await;
			done_rx.await.unwrap();
			drop(blocker);
		});
		drop(watcher);

		let wait = trigger.start_drain_and_wait(DrainMode::Graceful);
		tokio::pin!(wait);
		tokio::select! {
			_ = tokio::time::sleep(Duration::from_millis(20)) => {},
			_ = &mut wait => panic!("drain completed while a blocker was held"),
		}
		done_tx.send(()).unwrap();
		tokio::time::timeout(Duration::from_secs(1), wait)
			.await
			.expect("drain should complete once blockers release");
	}

	#[tokio::test]
	async fn weak_watchers_do_not_block() {
		let (trigger, watcher) = new();
		let (mut upgrader, weak) = watcher.into_weak();
		// A lingering weak clone must not wedge the drain.
		let _idle = weak.clone();
		upgrader.disable();
		tokio::time::timeout(
			Duration::from_secs(1),
			trigger.start_drain_and_wait(DrainMode::Graceful),
		)
		.await
		.expect("weak watcher should not block drain");
	}
}
