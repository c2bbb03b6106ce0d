use async_nats::Event;
use futures_util::StreamExt;
use router_core::drain::DrainWatcher;
use router_core::prelude::*;
use serde::Serialize;
use tokio::sync::watch;

use crate::feeds::{Backoff, apply_registration};
use crate::registry::Registry;
use crate::telemetry::metrics::{FeedSource, Metrics, MutationKind};
use crate::types::RegistrationMessage;

const REGISTER_SUBJECT: &str = "router.register";
const UNREGISTER_SUBJECT: &str = "router.unregister";
const START_SUBJECT: &str = "router.start";

#[derive(Debug, Clone)]
pub struct BusConfig {
	pub servers: Vec<String>,
	/// How often `router.start` is re-published.
	pub advertise_interval: Duration,
	/// Advertised minimum interval between client re-registrations.
	pub min_register_interval: Duration,
	/// Advertised prune threshold, after which unrefreshed routes drop.
	pub prune_threshold: Duration,
}

impl Default for BusConfig {
	fn default() -> Self {
		BusConfig {
			servers: vec!["nats://127.0.0.1:4222".to_string()],
			advertise_interval: Duration::from_secs(30),
			min_register_interval: Duration::from_secs(20),
			prune_threshold: Duration::from_secs(120),
		}
	}
}

/// Payload of the periodic `router.start` advertisement.
#[derive(Serialize)]
struct RouterStart<'a> {
	id: &'a str,
	minimum_register_interval_in_seconds: u64,
	prune_threshold_in_seconds: u64,
}

/// Message-bus registration feed: consumes register/unregister subjects,
/// advertises `router.start`, and exposes a health flag the pruner watches.
pub struct BusFeed {
	cfg: BusConfig,
	registry: Arc<Registry>,
	metrics: Arc<Metrics>,
	health_tx: watch::Sender<bool>,
	id: String,
}

impl BusFeed {
	pub fn new(
		cfg: BusConfig,
		registry: Arc<Registry>,
		metrics: Arc<Metrics>,
	) -> (BusFeed, watch::Receiver<bool>) {
		let (health_tx, health_rx) = watch::channel(false);
		(
			BusFeed {
				cfg,
				registry,
				metrics,
				health_tx,
				id: uuid::Uuid::new_v4().to_string(),
			},
			health_rx,
		)
	}

	pub async fn run(self, drain: DrainWatcher) {
		let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
		let drained = drain.wait_for_drain();
		tokio::pin!(drained);
		loop {
			tokio::select! {
				res = self.connect_and_serve() => {
					self.set_health(false);
					match res {
						Ok(()) => return,
						Err(e) => {
							let delay = backoff.next();
							warn!("bus feed disconnected: {e}; reconnecting in {delay:?}");
							tokio::select! {
								_ = tokio::time::sleep(delay) => {}
								_ = &mut drained => return,
							}
						},
					}
				}
				_ = &mut drained => {
					debug!("bus feed stopped, drain started");
					self.set_health(false);
					return;
				}
			}
		}
	}

	fn set_health(&self, healthy: bool) {
		let _ = self.health_tx.send(healthy);
		self.metrics.bus_connected.set(healthy as i64);
	}

	async fn connect_and_serve(&self) -> anyhow::Result<()> {
		let servers = self.cfg.servers.join(",");
		let health = self.health_tx.clone();
		let gauge = self.metrics.bus_connected.clone();
		let client = async_nats::ConnectOptions::new()
			.event_callback(move |event| {
				let health = health.clone();
				let gauge = gauge.clone();
				async move {
					match event {
						Event::Connected => {
							info!("bus connected");
							let _ = health.send(true);
							gauge.set(1);
						},
						Event::Disconnected => {
							warn!("bus disconnected");
							let _ = health.send(false);
							gauge.set(0);
						},
						other => debug!("bus event: {other}"),
					}
				}
			})
			.connect(servers)
			.await
			.context("bus connect")?;

		let mut register = client
			.subscribe(REGISTER_SUBJECT)
			.await
			.context("subscribe router.register")?;
		let mut unregister = client
			.subscribe(UNREGISTER_SUBJECT)
			.await
			.context("subscribe router.unregister")?;
		self.set_health(true);
		self.advertise(&client).await?;

		let mut advertise = tokio::time::interval(self.cfg.advertise_interval);
		advertise.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		advertise.reset();

		loop {
			tokio::select! {
				msg = register.next() => {
					let Some(msg) = msg else {
						anyhow::bail!("register subscription closed");
					};
					self.apply(&msg.payload, MutationKind::upsert);
				}
				msg = unregister.next() => {
					let Some(msg) = msg else {
						anyhow::bail!("unregister subscription closed");
					};
					self.apply(&msg.payload, MutationKind::remove);
				}
				_ = advertise.tick() => {
					self.advertise(&client).await?;
				}
			}
		}
	}

	async fn advertise(&self, client: &async_nats::Client) -> anyhow::Result<()> {
		let payload = serde_json::to_vec(&RouterStart {
			id: &self.id,
			minimum_register_interval_in_seconds: self.cfg.min_register_interval.as_secs(),
			prune_threshold_in_seconds: self.cfg.prune_threshold.as_secs(),
		})?;
		client
			.publish(START_SUBJECT, payload.into())
			.await
			.context("publish router.start")?;
		Ok(())
	}

	fn apply(&self, payload: &[u8], action: MutationKind) {
		let msg: RegistrationMessage = match serde_json::from_slice(payload) {
			Ok(msg) => msg,
			Err(e) => {
				self.metrics.malformed_registrations.inc();
				warn!("malformed bus registration: {e}");
				return;
			},
		};
		trace!(host = msg.host, port = msg.port, ?action, "bus registration");
		apply_registration(&self.registry, &self.metrics, FeedSource::bus, &msg, action);
	}
}
