use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::atomic::AtomicCell;
use router_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::{Endpoint, EndpointId, ModificationTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceStrategy {
	#[default]
	RoundRobin,
	LeastConnection,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
	pub strategy: BalanceStrategy,
	/// Prefer endpoints whose isolation segment matches `local_segment`, when
	/// any exist.
	pub locally_optimistic: bool,
	pub local_segment: Strng,
	/// Ceiling on round-trip attempts; the effective budget is
	/// `min(pool size, this)`.
	pub max_attempts: usize,
	/// Back-off applied to an endpoint after a transport-level failure.
	pub failure_backoff: Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig {
			strategy: BalanceStrategy::RoundRobin,
			locally_optimistic: false,
			local_segment: strng::EMPTY,
			max_attempts: 3,
			failure_backoff: Duration::from_secs(30),
		}
	}
}

/// Load-balance state shared between a pool and the snapshots handed to
/// request tasks. The cursor must outlive any one snapshot so round-robin
/// progresses across requests.
#[derive(Debug)]
pub struct LbState {
	cursor: AtomicUsize,
	cfg: PoolConfig,
}

/// Outcome of applying one registration to a pool.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PoolChange {
	Added,
	Updated,
	/// The message carried a stale tag; only the TTL was refreshed.
	Refreshed,
	Removed,
	/// Remove for an unknown identity or with a stale tag; a success, no-op.
	None,
}

/// The set of endpoints registered under one route key. Mutations replace the
/// endpoint slice wholesale so that readers holding a snapshot never observe
/// a torn pool.
#[derive(Debug)]
pub struct Pool {
	endpoints: RwLock<Arc<[Arc<Endpoint>]>>,
	lb: Arc<LbState>,
	route_service_url: RwLock<Option<Strng>>,
	empty_since: AtomicCell<Option<Instant>>,
}

impl Pool {
	pub fn new(cfg: PoolConfig) -> Pool {
		Pool {
			endpoints: RwLock::new(Vec::new().into()),
			lb: Arc::new(LbState {
				cursor: AtomicUsize::new(0),
				cfg,
			}),
			route_service_url: RwLock::new(None),
			empty_since: AtomicCell::new(Some(Instant::now())),
		}
	}

	pub fn len(&self) -> usize {
		self.endpoints.read().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// How long the pool has been empty, if it is.
	pub fn empty_since(&self) -> Option<Instant> {
		self.empty_since.load()
	}

	pub fn set_route_service_url(&self, url: Option<Strng>) {
		*self.route_service_url.write().unwrap() = url;
	}

	/// Applies an upsert. Accepts iff the identity is unknown or the incoming
	/// tag strictly supersedes the stored one; a stale tag still refreshes the
	/// TTL so heartbeats with a fixed tag keep the endpoint alive. An accepted
	/// re-registration with unchanged attributes refreshes the live entry in
	/// place rather than replacing it, preserving its stats and back-off.
	pub fn upsert(&self, incoming: Arc<Endpoint>, ttl: Duration) -> PoolChange {
		let mut eps = self.endpoints.write().unwrap();
		match eps.iter().position(|e| e.id == incoming.id) {
			None => {
				incoming.refresh(ttl);
				let mut next: Vec<Arc<Endpoint>> = eps.to_vec();
				next.push(incoming);
				*eps = next.into();
				self.empty_since.store(None);
				PoolChange::Added
			},
			Some(idx) => {
				let current = &eps[idx];
				if !current.superseded_by(&incoming.tag()) {
					current.refresh(ttl);
					return PoolChange::Refreshed;
				}
				if current.same_attributes(&incoming) {
					current.set_tag(incoming.tag());
					current.refresh(ttl);
					return PoolChange::Refreshed;
				}
				incoming.refresh(ttl);
				let mut next: Vec<Arc<Endpoint>> = eps.to_vec();
				next[idx] = incoming;
				*eps = next.into();
				PoolChange::Updated
			},
		}
	}

	/// Applies a remove under the same tag rule. Removing an unknown identity
	/// succeeds as a no-op.
	pub fn remove(&self, id: &EndpointId, tag: &ModificationTag) -> (PoolChange, Option<Arc<Endpoint>>) {
		let mut eps = self.endpoints.write().unwrap();
		let Some(idx) = eps.iter().position(|e| &e.id == id) else {
			return (PoolChange::None, None);
		};
		if !eps[idx].superseded_by(tag) {
			return (PoolChange::None, None);
		}
		let mut next: Vec<Arc<Endpoint>> = eps.to_vec();
		let removed = next.remove(idx);
		let now_empty = next.is_empty();
		*eps = next.into();
		if now_empty {
			self.empty_since.store(Some(Instant::now()));
		}
		(PoolChange::Removed, Some(removed))
	}

	/// Drops every endpoint whose stale deadline has passed, returning them.
	pub fn prune_stale(&self, now: Instant) -> Vec<Arc<Endpoint>> {
		let mut eps = self.endpoints.write().unwrap();
		if !eps.iter().any(|e| e.is_stale(now)) {
			return Vec::new();
		}
		let (live, stale): (Vec<_>, Vec<_>) = eps.iter().cloned().partition(|e| !e.is_stale(now));
		let now_empty = live.is_empty();
		*eps = live.into();
		if now_empty {
			self.empty_since.store(Some(Instant::now()));
		}
		stale
	}

	pub fn snapshot(&self) -> PoolSnapshot {
		PoolSnapshot {
			endpoints: self.endpoints.read().unwrap().clone(),
			route_service_url: self.route_service_url.read().unwrap().clone(),
			lb: self.lb.clone(),
		}
	}
}

/// An immutable view of a pool taken at lookup time, plus the shared
/// load-balance state. This is what request tasks receive; the pool itself is
/// never handed out.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
	pub endpoints: Arc<[Arc<Endpoint>]>,
	pub route_service_url: Option<Strng>,
	lb: Arc<LbState>,
}

impl PoolSnapshot {
	pub fn len(&self) -> usize {
		self.endpoints.len()
	}

	pub fn is_empty(&self) -> bool {
		self.endpoints.is_empty()
	}

	/// Total round-trip attempts allowed against this snapshot.
	pub fn attempt_budget(&self) -> usize {
		self.endpoints.len().min(self.lb.cfg.max_attempts).max(1)
	}

	pub fn backoff(&self) -> Duration {
		self.lb.cfg.failure_backoff
	}

	/// Chooses the next endpoint. A sticky hint matching a healthy endpoint's
	/// private instance id wins outright; otherwise candidates are narrowed to
	/// the local isolation segment when configured and present, endpoints in
	/// back-off are skipped, and the configured strategy picks among the rest.
	pub fn next(&self, sticky: Option<&str>) -> Option<Arc<Endpoint>> {
		let now = Instant::now();
		if let Some(hint) = sticky
			&& !hint.is_empty()
			&& let Some(ep) = self
				.endpoints
				.iter()
				.find(|e| e.id.instance_id.as_str() == hint && !e.in_backoff(now))
		{
			return Some(ep.clone());
		}

		let cfg = &self.lb.cfg;
		let mut candidates: Vec<&Arc<Endpoint>> = self.endpoints.iter().collect();
		if cfg.locally_optimistic && !cfg.local_segment.is_empty() {
			let local: Vec<&Arc<Endpoint>> = candidates
				.iter()
				.copied()
				.filter(|e| e.isolation_segment == cfg.local_segment)
				.collect();
			if !local.is_empty() {
				candidates = local;
			}
		}
		let healthy: Vec<&Arc<Endpoint>> = candidates
			.iter()
			.copied()
			.filter(|e| !e.in_backoff(now))
			.collect();
		// With every candidate backing off we still route rather than fail the
		// request outright; the back-off only orders preference.
		let pick_from = if healthy.is_empty() { candidates } else { healthy };
		if pick_from.is_empty() {
			return None;
		}

		let idx = match cfg.strategy {
			BalanceStrategy::RoundRobin => self.lb.cursor.fetch_add(1, Ordering::Relaxed) % pick_from.len(),
			BalanceStrategy::LeastConnection => {
				let min = pick_from
					.iter()
					.map(|e| e.stats.active_requests())
					.min()
					.unwrap_or(0);
				let ties: Vec<usize> = pick_from
					.iter()
					.enumerate()
					.filter(|(_, e)| e.stats.active_requests() == min)
					.map(|(i, _)| i)
					.collect();
				ties[self.lb.cursor.fetch_add(1, Ordering::Relaxed) % ties.len()]
			},
		};
		Some(pick_from[idx].clone())
	}

	pub fn mark_failed(&self, ep: &Endpoint) {
		ep.mark_failed(self.lb.cfg.failure_backoff);
	}

	/// Whether the sticky hint refers to an endpoint in this snapshot.
	pub fn sticky_member(&self, hint: &str) -> bool {
		!hint.is_empty()
			&& self
				.endpoints
				.iter()
				.any(|e| e.id.instance_id.as_str() == hint)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use super::*;
	use crate::types::EndpointId;

	fn ep(host: &str, port: u16, instance: &str) -> Arc<Endpoint> {
		Arc::new(Endpoint::new(
			EndpointId {
				host: strng::new(host),
				port,
				instance_id: strng::new(instance),
			},
			Duration::from_secs(120),
		))
	}

	fn pool_with(n: u16) -> Pool {
		let pool = Pool::new(PoolConfig::default());
		for i in 0..n {
			pool.upsert(ep("10.0.0.1", 8080 + i, &format!("i-{i}")), Duration::from_secs(120));
		}
		pool
	}

	#[test]
	fn round_robin_visits_all_within_n() {
		let pool = pool_with(4);
		let snap = pool.snapshot();
		let seen: HashSet<u16> = (0..4).map(|_| snap.next(None).unwrap().id.port).collect();
		assert_eq!(seen.len(), 4);
	}

	#[test]
	fn least_connection_prefers_idle() {
		let pool = Pool::new(PoolConfig {
			strategy: BalanceStrategy::LeastConnection,
			..Default::default()
		});
		pool.upsert(ep("10.0.0.1", 8080, "a"), Duration::from_secs(120));
		pool.upsert(ep("10.0.0.1", 8081, "b"), Duration::from_secs(120));
		let snap = pool.snapshot();
		let busy = snap
			.endpoints
			.iter()
			.find(|e| e.id.port == 8080)
			.unwrap()
			.clone();
		let _guard = busy.begin_request();
		for _ in 0..4 {
			assert_eq!(snap.next(None).unwrap().id.port, 8081);
		}
	}

	#[test]
	fn backoff_skips_until_cleared() {
		let pool = pool_with(2);
		let snap = pool.snapshot();
		let bad = snap.endpoints[0].clone();
		snap.mark_failed(&bad);
		for _ in 0..4 {
			assert_ne!(snap.next(None).unwrap().id, bad.id);
		}
		bad.record_success();
		let seen: HashSet<u16> = (0..4).map(|_| snap.next(None).unwrap().id.port).collect();
		assert_eq!(seen.len(), 2);
	}

	#[test]
	fn all_backed_off_still_routes() {
		let pool = pool_with(2);
		let snap = pool.snapshot();
		for e in snap.endpoints.iter() {
			snap.mark_failed(e);
		}
		assert!(snap.next(None).is_some());
	}

	#[test]
	fn sticky_hint_wins_when_present() {
		let pool = pool_with(3);
		let snap = pool.snapshot();
		for _ in 0..5 {
			assert_eq!(snap.next(Some("i-1")).unwrap().id.instance_id.as_str(), "i-1");
		}
		// Unknown hint falls back to a fresh choice.
		assert!(snap.next(Some("gone")).is_some());
		assert!(!snap.sticky_member("gone"));
	}

	#[test]
	fn locally_optimistic_restricts_then_falls_back() {
		let pool = Pool::new(PoolConfig {
			locally_optimistic: true,
			local_segment: strng::new("az1"),
			..Default::default()
		});
		let mut local = Endpoint::new(
			EndpointId {
				host: strng::new("10.0.0.1"),
				port: 8080,
				instance_id: strng::new("local"),
			},
			Duration::from_secs(120),
		);
		local.isolation_segment = strng::new("az1");
		let local_id = local.id.clone();
		pool.upsert(Arc::new(local), Duration::from_secs(120));
		pool.upsert(ep("10.0.0.2", 8080, "remote"), Duration::from_secs(120));

		let snap = pool.snapshot();
		for _ in 0..4 {
			assert_eq!(snap.next(None).unwrap().isolation_segment.as_str(), "az1");
		}

		// Remove the local endpoint; selection must fall back to the full set.
		let tag = ModificationTag {
			guid: strng::new("rm"),
			index: 1,
		};
		pool.remove(&local_id, &tag);
		let snap = pool.snapshot();
		assert_eq!(snap.next(None).unwrap().id.instance_id.as_str(), "remote");
	}

	#[test]
	fn stale_tag_upsert_refreshes_only() {
		let pool = Pool::new(PoolConfig::default());
		let id = EndpointId {
			host: strng::new("10.0.0.1"),
			port: 8080,
			instance_id: strng::new("i-0"),
		};
		let mut first = Endpoint::new(id.clone(), Duration::from_secs(120));
		first.app_id = strng::new("app-v5");
		first.set_tag(ModificationTag {
			guid: strng::new("g"),
			index: 5,
		});
		assert_eq!(pool.upsert(Arc::new(first), Duration::from_secs(120)), PoolChange::Added);

		let mut stale = Endpoint::new(id.clone(), Duration::from_secs(120));
		stale.app_id = strng::new("app-v4");
		stale.set_tag(ModificationTag {
			guid: strng::new("g"),
			index: 4,
		});
		assert_eq!(
			pool.upsert(Arc::new(stale), Duration::from_secs(120)),
			PoolChange::Refreshed
		);
		let snap = pool.snapshot();
		assert_eq!(snap.endpoints[0].app_id.as_str(), "app-v5");
	}

	#[test]
	fn attempt_budget_clamped_by_size_and_ceiling() {
		assert_eq!(pool_with(5).snapshot().attempt_budget(), 3);
		assert_eq!(pool_with(2).snapshot().attempt_budget(), 2);
		assert_eq!(pool_with(1).snapshot().attempt_budget(), 1);
		// Never below one, even for an empty snapshot.
		assert_eq!(pool_with(0).snapshot().attempt_budget(), 1);
	}

	#[test]
	fn prune_removes_expired() {
		let pool = Pool::new(PoolConfig::default());
		pool.upsert(ep("10.0.0.1", 8080, "a"), Duration::from_millis(1));
		pool.upsert(ep("10.0.0.1", 8081, "b"), Duration::from_secs(600));
		std::thread::sleep(Duration::from_millis(5));
		let removed = pool.prune_stale(Instant::now());
		assert_eq!(removed.len(), 1);
		assert_eq!(removed[0].id.port, 8080);
		assert_eq!(pool.len(), 1);
	}
}
