use prometheus_client::registry::Registry as PromRegistry;
use router_core::prelude::*;
use router_core::{drain, signal};
use tokio::sync::watch;

use crate::client::BackendClient;
use crate::feeds::api::ApiFeed;
use crate::feeds::bus::BusFeed;
use crate::proxy::Gateway;
use crate::proxy::gateway::BoundListeners;
use crate::registry::Registry;
use crate::routeservice::Keyring;
use crate::telemetry::metrics::Metrics;
use crate::{Config, ProxyInputs, accesslog};

/// A listener could not be bound; mapped to exit code 2 by the binary.
#[derive(thiserror::Error, Debug)]
#[error("startup bind failure: {0}")]
pub struct BindError(#[source] pub anyhow::Error);

/// Wires up the registry, feeds, access-log pipeline, and listeners, and
/// starts the whole process. Returns once everything is running.
pub async fn run(cfg: Arc<Config>) -> anyhow::Result<Bound> {
	let mut prom = PromRegistry::default();
	let metrics = Arc::new(Metrics::new(&mut prom));
	let registry = Registry::new(cfg.registry.clone(), metrics.clone());
	let backends = BackendClient::new(cfg.backend.clone());

	let route_services = match &cfg.route_service {
		Some(kc) => Some(Arc::new(Keyring::new(kc)?)),
		None => None,
	};

	let (drain_tx, drain_rx) = drain::new();

	let (access_log, log_task) = accesslog::Pipeline::spawn(&cfg.access_log, metrics.clone()).await?;

	// Listeners bind before anything else starts, so a bind failure aborts
	// startup cleanly.
	let listeners = BoundListeners::bind(&cfg).await.map_err(BindError)?;
	info!(addr = %listeners.http_addr(), "bound http listener");

	let (draining_tx, draining_rx) = watch::channel(false);
	let pi = Arc::new(ProxyInputs {
		cfg: cfg.clone(),
		registry: registry.clone(),
		metrics: metrics.clone(),
		backends,
		access_log,
		route_services,
		draining: draining_rx,
	});

	// Feeds. The pruner follows the bus feed's health when configured to.
	let bus_health = match cfg.bus.clone() {
		Some(bus_cfg) => {
			let (feed, health) = BusFeed::new(bus_cfg, registry.clone(), metrics.clone());
			tokio::spawn(feed.run(drain_rx.clone()));
			health
		},
		None => {
			// No bus feed: the registry treats the bus as permanently healthy.
			let (tx, rx) = watch::channel(true);
			std::mem::forget(tx);
			rx
		},
	};
	if let Some(api_cfg) = cfg.routing_api.clone() {
		let feed = ApiFeed::new(api_cfg, registry.clone(), metrics.clone());
		tokio::spawn(feed.run(drain_rx.clone()));
	}
	registry.spawn_pruner(drain_rx.clone(), bus_health);

	let gateway = Gateway::new(pi, drain_rx.clone(), draining_tx, listeners);
	tokio::spawn(gateway.run());

	Ok(Bound {
		drain_tx,
		drain_timeout: cfg.drain_timeout,
		log_task,
	})
}

pub struct Bound {
	drain_tx: drain::DrainTrigger,
	drain_timeout: Duration,
	log_task: tokio::task::JoinHandle<()>,
}

/// How the process came down; the binary maps this to an exit code.
#[derive(Debug, PartialEq, Eq)]
pub enum Termination {
	Clean,
	DrainTimeoutExceeded,
}

impl Bound {
	/// Blocks until a shutdown signal, then drains: the listeners refuse new
	/// work after the grace interval while in-flight requests finish, up to
	/// the drain timeout.
	pub async fn wait_termination(self) -> anyhow::Result<Termination> {
		signal::shutdown_requested().await;
		info!("shutdown requested, draining");
		let drained = tokio::time::timeout(
			self.drain_timeout,
			self.drain_tx.start_drain_and_wait(drain::DrainMode::Graceful),
		)
		.await;
		let termination = match drained {
			Ok(()) => Termination::Clean,
			Err(_) => {
				warn!("drain timeout exceeded with work still in flight");
				Termination::DrainTimeoutExceeded
			},
		};
		// Let the access-log consumer flush whatever is queued.
		let _ = tokio::time::timeout(Duration::from_secs(1), self.log_task).await;
		Ok(termination)
	}
}
