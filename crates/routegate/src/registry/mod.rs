pub mod pool;

use std::collections::HashMap;
use std::sync::RwLock;

pub use pool::{BalanceStrategy, Pool, PoolChange, PoolConfig, PoolSnapshot};
use router_core::drain::DrainWatcher;
use router_core::prelude::*;
use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::telemetry::metrics::Metrics;
use crate::types::{Endpoint, EndpointId, ModificationTag, RouteKey, RouterGroup, TcpRouteKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
	Upsert,
	Remove,
}

/// Address of a mutated route: HTTP keys match by host and path prefix, TCP
/// keys by router group and external port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteAddress {
	Http(RouteKey),
	Tcp(TcpRouteKey),
}

impl Display for RouteAddress {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RouteAddress::Http(k) => write!(f, "{k}"),
			RouteAddress::Tcp(k) => write!(f, "{k}"),
		}
	}
}

/// One event per accepted mutation, delivered in order to subscribers.
#[derive(Debug, Clone)]
pub struct RouteEvent {
	pub action: EventAction,
	pub key: RouteAddress,
	pub endpoint: Arc<Endpoint>,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
	pub prune_interval: Duration,
	/// Skip sweeps while the bus feed is unhealthy.
	pub suspend_pruning_on_bus_outage: bool,
	/// Empty pools are garbage-collected after sitting empty this long.
	pub empty_pool_grace: Duration,
	pub event_buffer: usize,
	pub pool: PoolConfig,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		let prune_interval = Duration::from_secs(30);
		RegistryConfig {
			prune_interval,
			suspend_pruning_on_bus_outage: false,
			empty_pool_grace: prune_interval * 2,
			event_buffer: 1024,
			pool: PoolConfig::default(),
		}
	}
}

/// Host entry: path-keyed pools ordered longest path first, so the first
/// match during lookup is the longest-prefix winner.
#[derive(Default)]
struct HostEntry {
	paths: Vec<(Strng, Arc<Pool>)>,
}

impl HostEntry {
	fn pool_for(&mut self, path: &Strng, cfg: &PoolConfig) -> Arc<Pool> {
		if let Some((_, pool)) = self.paths.iter().find(|(p, _)| p == path) {
			return pool.clone();
		}
		let pool = Arc::new(Pool::new(cfg.clone()));
		self.paths.push((path.clone(), pool.clone()));
		self.paths.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
		pool
	}

	fn get(&self, path: &str) -> Option<&Arc<Pool>> {
		self.paths.iter().find(|(p, _)| p.as_str() == path).map(|(_, pool)| pool)
	}
}

struct Inner {
	http: HashMap<Strng, HostEntry>,
	tcp: HashMap<TcpRouteKey, Arc<Pool>>,
	router_groups: Vec<RouterGroup>,
}

/// The in-memory route table. Every request performs one lookup; reads take
/// the table lock only long enough to clone a pool snapshot, and all pool
/// mutation happens by replacement so lookups never block on writes in any
/// meaningful window.
pub struct Registry {
	inner: RwLock<Inner>,
	tx: broadcast::Sender<RouteEvent>,
	metrics: Arc<Metrics>,
	cfg: RegistryConfig,
}

impl Registry {
	pub fn new(cfg: RegistryConfig, metrics: Arc<Metrics>) -> Arc<Registry> {
		let (tx, _) = broadcast::channel(cfg.event_buffer.max(1));
		Arc::new(Registry {
			inner: RwLock::new(Inner {
				http: HashMap::new(),
				tcp: HashMap::new(),
				router_groups: Vec::new(),
			}),
			tx,
			metrics,
			cfg,
		})
	}

	pub fn config(&self) -> &RegistryConfig {
		&self.cfg
	}

	/// Registers (or refreshes) an endpoint under an HTTP route key.
	pub fn upsert(
		&self,
		key: &RouteKey,
		endpoint: Endpoint,
		ttl: Duration,
		route_service_url: Option<Strng>,
	) -> PoolChange {
		let pool = {
			let mut inner = self.inner.write().unwrap();
			inner
				.http
				.entry(key.host.clone())
				.or_default()
				.pool_for(&key.path, &self.cfg.pool)
		};
		pool.set_route_service_url(route_service_url);
		let endpoint = Arc::new(endpoint);
		let change = pool.upsert(endpoint.clone(), ttl);
		if matches!(change, PoolChange::Added | PoolChange::Updated) {
			self.publish(RouteEvent {
				action: EventAction::Upsert,
				key: RouteAddress::Http(key.clone()),
				endpoint,
			});
		}
		change
	}

	/// Removes an endpoint, honoring the modification-tag ordering. Removing
	/// an unknown identity succeeds as a no-op.
	pub fn remove(&self, key: &RouteKey, id: &EndpointId, tag: &ModificationTag) -> PoolChange {
		let pool = {
			let inner = self.inner.read().unwrap();
			inner.http.get(&key.host).and_then(|h| h.get(&key.path)).cloned()
		};
		let Some(pool) = pool else {
			return PoolChange::None;
		};
		let (change, removed) = pool.remove(id, tag);
		if let Some(endpoint) = removed {
			self.publish(RouteEvent {
				action: EventAction::Remove,
				key: RouteAddress::Http(key.clone()),
				endpoint,
			});
		}
		change
	}

	pub fn upsert_tcp(&self, key: &TcpRouteKey, endpoint: Endpoint, ttl: Duration) -> PoolChange {
		let pool = {
			let mut inner = self.inner.write().unwrap();
			inner
				.tcp
				.entry(key.clone())
				.or_insert_with(|| Arc::new(Pool::new(self.cfg.pool.clone())))
				.clone()
		};
		let endpoint = Arc::new(endpoint);
		let change = pool.upsert(endpoint.clone(), ttl);
		if matches!(change, PoolChange::Added | PoolChange::Updated) {
			self.publish(RouteEvent {
				action: EventAction::Upsert,
				key: RouteAddress::Tcp(key.clone()),
				endpoint,
			});
		}
		change
	}

	pub fn remove_tcp(&self, key: &TcpRouteKey, id: &EndpointId, tag: &ModificationTag) -> PoolChange {
		let pool = {
			let inner = self.inner.read().unwrap();
			inner.tcp.get(key).cloned()
		};
		let Some(pool) = pool else {
			return PoolChange::None;
		};
		let (change, removed) = pool.remove(id, tag);
		if let Some(endpoint) = removed {
			self.publish(RouteEvent {
				action: EventAction::Remove,
				key: RouteAddress::Tcp(key.clone()),
				endpoint,
			});
		}
		change
	}

	/// Longest-prefix lookup. The host matches exactly (case-insensitive);
	/// among path-keyed pools the longest matching prefix with live endpoints
	/// wins. No route is not an error: the caller maps `None` to 404.
	pub fn lookup(&self, host: &str, path: &str) -> Option<PoolSnapshot> {
		self.metrics.route_lookups.inc();
		let found = self.lookup_inner(host, path);
		if found.is_none() {
			self.metrics.route_misses.inc();
		}
		found
	}

	fn lookup_inner(&self, host: &str, path: &str) -> Option<PoolSnapshot> {
		let host = host.to_ascii_lowercase();
		let inner = self.inner.read().unwrap();
		let entry = inner.http.get(host.as_str())?;
		for (prefix, pool) in &entry.paths {
			if !path_matches(prefix, path) {
				continue;
			}
			let snap = pool.snapshot();
			if !snap.is_empty() {
				return Some(snap);
			}
		}
		None
	}

	pub fn lookup_tcp(&self, key: &TcpRouteKey) -> Option<PoolSnapshot> {
		let inner = self.inner.read().unwrap();
		let snap = inner.tcp.get(key)?.snapshot();
		(!snap.is_empty()).then_some(snap)
	}

	/// Dump of every route and its endpoints, for diagnostics.
	pub fn snapshot(&self) -> Vec<(String, Vec<Arc<Endpoint>>)> {
		let inner = self.inner.read().unwrap();
		let mut out = Vec::new();
		for (host, entry) in &inner.http {
			for (path, pool) in &entry.paths {
				let key = if path.is_empty() {
					host.to_string()
				} else {
					format!("{host}{path}")
				};
				out.push((key, pool.snapshot().endpoints.to_vec()));
			}
		}
		for (key, pool) in &inner.tcp {
			out.push((key.to_string(), pool.snapshot().endpoints.to_vec()));
		}
		out.sort_by(|(a, _), (b, _)| a.cmp(b));
		out
	}

	pub fn set_router_groups(&self, groups: Vec<RouterGroup>) {
		self.inner.write().unwrap().router_groups = groups;
	}

	pub fn router_groups(&self) -> Vec<RouterGroup> {
		self.inner.read().unwrap().router_groups.clone()
	}

	/// Ordered stream of accepted mutations. A subscriber that falls behind
	/// the event buffer observes a counted lag error and continues; the
	/// writer never blocks on it.
	pub fn subscribe(self: &Arc<Self>) -> impl futures_util::Stream<Item = RouteEvent> + use<> {
		let metrics = self.metrics.clone();
		BroadcastStream::new(self.tx.subscribe()).filter_map(move |ev| match ev {
			Ok(ev) => Some(ev),
			Err(BroadcastStreamRecvError::Lagged(n)) => {
				metrics.dropped_route_events.inc_by(n);
				warn!("route event subscriber lagged, dropped {n} events");
				None
			},
		})
	}

	fn publish(&self, ev: RouteEvent) {
		// No subscribers is fine; broadcast just drops it.
		let _ = self.tx.send(ev);
	}

	/// One prune sweep; returns the number of endpoints removed.
	pub fn prune(&self, now: Instant) -> u64 {
		let (http_pools, tcp_pools) = {
			let inner = self.inner.read().unwrap();
			let http: Vec<(RouteKey, Arc<Pool>)> = inner
				.http
				.iter()
				.flat_map(|(host, entry)| {
					entry.paths.iter().map(|(path, pool)| {
						(
							RouteKey {
								host: host.clone(),
								path: path.clone(),
							},
							pool.clone(),
						)
					})
				})
				.collect();
			let tcp: Vec<(TcpRouteKey, Arc<Pool>)> =
				inner.tcp.iter().map(|(k, p)| (k.clone(), p.clone())).collect();
			(http, tcp)
		};

		let mut pruned = 0u64;
		for (key, pool) in http_pools {
			for endpoint in pool.prune_stale(now) {
				pruned += 1;
				self.publish(RouteEvent {
					action: EventAction::Remove,
					key: RouteAddress::Http(key.clone()),
					endpoint,
				});
			}
		}
		for (key, pool) in tcp_pools {
			for endpoint in pool.prune_stale(now) {
				pruned += 1;
				self.publish(RouteEvent {
					action: EventAction::Remove,
					key: RouteAddress::Tcp(key.clone()),
					endpoint,
				});
			}
		}
		if pruned > 0 {
			self.metrics.routes_pruned.inc_by(pruned);
		}
		self.collect_empty_pools(now);
		pruned
	}

	/// Drops pools that have sat empty past the grace period.
	fn collect_empty_pools(&self, now: Instant) {
		let grace = self.cfg.empty_pool_grace;
		let expired = |pool: &Arc<Pool>| match pool.empty_since() {
			Some(since) => now.duration_since(since) >= grace,
			None => false,
		};
		let mut inner = self.inner.write().unwrap();
		for entry in inner.http.values_mut() {
			entry.paths.retain(|(_, pool)| !expired(pool));
		}
		inner.http.retain(|_, entry| !entry.paths.is_empty());
		inner.tcp.retain(|_, pool| !expired(pool));
	}

	/// Periodic TTL sweep. Suspended while the bus feed is down when so
	/// configured, so a bus outage does not dump the whole route table.
	pub fn spawn_pruner(
		self: &Arc<Self>,
		drain: DrainWatcher,
		bus_healthy: watch::Receiver<bool>,
	) -> tokio::task::JoinHandle<()> {
		let registry = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(registry.cfg.prune_interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			let drained = drain.wait_for_drain();
			tokio::pin!(drained);
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						if registry.cfg.suspend_pruning_on_bus_outage && !*bus_healthy.borrow() {
							debug!("bus unhealthy, skipping prune sweep");
							continue;
						}
						let pruned = registry.prune(Instant::now());
						if pruned > 0 {
							info!(pruned, "pruned stale endpoints");
						}
					}
					_ = &mut drained => {
						debug!("pruner stopped, drain started");
						return;
					}
				}
			}
		})
	}
}

fn path_matches(prefix: &str, path: &str) -> bool {
	if prefix.is_empty() {
		return true;
	}
	match path.strip_prefix(prefix) {
		Some(rest) => rest.is_empty() || rest.starts_with('/'),
		None => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{EndpointId, RegistrationMessage};

	fn metrics() -> Arc<Metrics> {
		let mut reg = prometheus_client::registry::Registry::default();
		Arc::new(Metrics::new(&mut reg))
	}

	fn registry() -> Arc<Registry> {
		Registry::new(RegistryConfig::default(), metrics())
	}

	fn endpoint(host: &str, port: u16, instance: &str, guid: &str, index: u64) -> Endpoint {
		let ep = Endpoint::new(
			EndpointId {
				host: strng::new(host),
				port,
				instance_id: strng::new(instance),
			},
			Duration::from_secs(120),
		);
		ep.set_tag(ModificationTag {
			guid: strng::new(guid),
			index,
		});
		ep
	}

	#[test]
	fn lookup_prefers_longest_prefix() {
		let r = registry();
		let ttl = Duration::from_secs(120);
		r.upsert(
			&RouteKey::parse("foo.example.com"),
			endpoint("10.0.0.1", 8080, "root", "g", 1),
			ttl,
			None,
		);
		r.upsert(
			&RouteKey::parse("foo.example.com/api"),
			endpoint("10.0.0.2", 8080, "api", "g", 1),
			ttl,
			None,
		);
		r.upsert(
			&RouteKey::parse("foo.example.com/api/v2"),
			endpoint("10.0.0.3", 8080, "apiv2", "g", 1),
			ttl,
			None,
		);

		let pick = |path: &str| {
			r.lookup("foo.example.com", path)
				.unwrap()
				.next(None)
				.unwrap()
				.id
				.instance_id
				.to_string()
		};
		assert_eq!(pick("/"), "root");
		assert_eq!(pick("/api"), "api");
		assert_eq!(pick("/api/v2/users"), "apiv2");
		assert_eq!(pick("/apiv2"), "root");
		// Hosts match case-insensitively.
		assert!(r.lookup("FOO.Example.Com", "/").is_some());
		assert!(r.lookup("bar.example.com", "/").is_none());
	}

	#[test]
	fn mutations_converge_on_highest_tag() {
		let r = registry();
		let key = RouteKey::parse("app.example.com");
		let ttl = Duration::from_secs(120);

		// Deliver upserts out of order; only the highest tag's attributes stick.
		for index in [5u64, 3, 4] {
			let mut ep = endpoint("10.0.0.1", 8080, "i-0", "g", index);
			ep.app_id = strng::new(format!("app-v{index}"));
			r.upsert(&key, ep, ttl, None);
		}
		let snap = r.lookup("app.example.com", "/").unwrap();
		assert_eq!(snap.endpoints[0].app_id.as_str(), "app-v5");

		// A stale remove is a no-op.
		let id = snap.endpoints[0].id.clone();
		let stale = ModificationTag {
			guid: strng::new("g"),
			index: 4,
		};
		assert_eq!(r.remove(&key, &id, &stale), PoolChange::None);
		assert!(r.lookup("app.example.com", "/").is_some());

		// A newer remove applies.
		let newer = ModificationTag {
			guid: strng::new("g"),
			index: 6,
		};
		assert_eq!(r.remove(&key, &id, &newer), PoolChange::Removed);
		assert!(r.lookup("app.example.com", "/").is_none());

		// Removing an unknown identity is a success.
		assert_eq!(r.remove(&key, &id, &newer), PoolChange::None);
	}

	#[test]
	fn prune_removes_expired_endpoints() {
		let r = registry();
		let key = RouteKey::parse("app.example.com");
		r.upsert(
			&key,
			endpoint("10.0.0.1", 8080, "short", "g", 1),
			Duration::from_millis(1),
			None,
		);
		r.upsert(
			&key,
			endpoint("10.0.0.2", 8080, "long", "g", 1),
			Duration::from_secs(600),
			None,
		);
		std::thread::sleep(Duration::from_millis(5));
		assert_eq!(r.prune(Instant::now()), 1);
		let snap = r.lookup("app.example.com", "/").unwrap();
		assert_eq!(snap.len(), 1);
		assert_eq!(snap.endpoints[0].id.instance_id.as_str(), "long");
	}

	#[test]
	fn concurrent_lookup_sees_consistent_snapshot() {
		let r = registry();
		let key = RouteKey::parse("app.example.com");
		let ttl = Duration::from_secs(120);
		r.upsert(&key, endpoint("10.0.0.1", 8080, "stable", "g", 1), ttl, None);

		let snap = r.lookup("app.example.com", "/").unwrap();
		// Mutate while the snapshot is held.
		r.upsert(&key, endpoint("10.0.0.2", 8080, "new", "g", 1), ttl, None);
		// The held snapshot still contains exactly the pre-mutation state, and
		// the stable endpoint is present both before and after.
		assert_eq!(snap.len(), 1);
		assert_eq!(snap.endpoints[0].id.instance_id.as_str(), "stable");
		let after = r.lookup("app.example.com", "/").unwrap();
		assert_eq!(after.len(), 2);
		assert!(
			after
				.endpoints
				.iter()
				.any(|e| e.id.instance_id.as_str() == "stable")
		);
	}

	#[tokio::test]
	async fn change_stream_delivers_in_order() {
		let r = registry();
		let mut events = Box::pin(r.subscribe());
		let key = RouteKey::parse("app.example.com");
		let ttl = Duration::from_secs(120);
		r.upsert(&key, endpoint("10.0.0.1", 8080, "a", "g", 1), ttl, None);
		let id = EndpointId {
			host: strng::new("10.0.0.1"),
			port: 8080,
			instance_id: strng::new("a"),
		};
		r.remove(
			&key,
			&id,
			&ModificationTag {
				guid: strng::new("g"),
				index: 2,
			},
		);

		let first = events.next().await.unwrap();
		assert_eq!(first.action, EventAction::Upsert);
		let second = events.next().await.unwrap();
		assert_eq!(second.action, EventAction::Remove);
		assert_eq!(second.endpoint.id, id);

		// Duplicate upserts (stale tag) do not produce events.
		r.upsert(&key, endpoint("10.0.0.9", 1, "x", "g", 1), ttl, None);
		r.upsert(&key, endpoint("10.0.0.9", 1, "x", "g", 1), ttl, None);
		let ev = events.next().await.unwrap();
		assert_eq!(ev.endpoint.id.host.as_str(), "10.0.0.9");
		assert!(
			tokio::time::timeout(Duration::from_millis(50), events.next())
				.await
				.is_err()
		);
	}

	#[test]
	fn tcp_routes_key_by_group_and_port() {
		let r = registry();
		let msg: RegistrationMessage = serde_json::from_str(
			r#"{"host":"10.0.0.1","port":61000,"router_group_guid":"rg-1","external_port":5000}"#,
		)
		.unwrap();
		let key = msg.tcp_key().unwrap();
		r.upsert_tcp(&key, msg.endpoint(), msg.ttl());
		assert!(r.lookup_tcp(&key).is_some());
		assert!(
			r.lookup_tcp(&TcpRouteKey {
				router_group: strng::new("rg-1"),
				external_port: 5001,
			})
			.is_none()
		);
	}
}
