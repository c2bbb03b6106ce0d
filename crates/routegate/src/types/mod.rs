use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::atomic::AtomicCell;
use router_core::prelude::*;
use serde::{Deserialize, Serialize};

/// Identity of a backend instance. Two registrations with the same identity
/// refer to the same instance; the newer modification tag wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EndpointId {
	pub host: Strng,
	pub port: u16,
	/// Empty when the platform did not assign one; identity then degrades to
	/// (host, port).
	pub instance_id: Strng,
}

impl Display for EndpointId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// (guid, monotonic index) pair ordering mutations per identity. Out-of-order
/// feed messages resolve deterministically: same guid compares by index,
/// a different guid always supersedes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ModificationTag {
	#[serde(default)]
	pub guid: Strng,
	#[serde(default)]
	pub index: u64,
}

impl ModificationTag {
	pub fn succeeded_by(&self, other: &ModificationTag) -> bool {
		if self.guid != other.guid {
			return true;
		}
		other.index > self.index
	}

	/// Tag for feeds that do not version their messages. Each message gets its
	/// own guid, so by the different-guid rule the latest arrival always wins.
	pub fn fresh() -> ModificationTag {
		ModificationTag {
			guid: strng::new(uuid::Uuid::new_v4().to_string()),
			index: 0,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppProtocol {
	#[default]
	Http1,
	Http2,
	Tcp,
}

/// Mutable endpoint bookkeeping, updated lock-free from request tasks.
#[derive(Debug, Default)]
pub struct EndpointStats {
	active: AtomicUsize,
	last_used: AtomicCell<Option<Instant>>,
	backoff_until: AtomicCell<Option<Instant>>,
}

impl EndpointStats {
	pub fn active_requests(&self) -> usize {
		self.active.load(Ordering::Relaxed)
	}
}

/// A backend instance registered under one or more route keys. The
/// modification tag advances in place on accepted re-registrations so that
/// heartbeats never replace a live entry (and its stats) wholesale.
#[derive(Debug)]
pub struct Endpoint {
	pub id: EndpointId,
	pub tls: bool,
	pub server_cert_domain_san: Option<Strng>,
	pub app_id: Strng,
	pub instance_index: Strng,
	pub protocol: AppProtocol,
	pub isolation_segment: Strng,
	pub tags: BTreeMap<Strng, Strng>,
	tag: std::sync::RwLock<ModificationTag>,
	stale_at: AtomicCell<Instant>,
	pub stats: EndpointStats,
}

impl Endpoint {
	pub fn new(id: EndpointId, ttl: Duration) -> Endpoint {
		Endpoint {
			id,
			tls: false,
			server_cert_domain_san: None,
			app_id: strng::EMPTY,
			instance_index: strng::EMPTY,
			protocol: AppProtocol::Http1,
			isolation_segment: strng::EMPTY,
			tags: BTreeMap::new(),
			tag: std::sync::RwLock::new(ModificationTag::default()),
			stale_at: AtomicCell::new(Instant::now() + ttl),
			stats: EndpointStats::default(),
		}
	}

	pub fn tag(&self) -> ModificationTag {
		self.tag.read().unwrap().clone()
	}

	pub fn set_tag(&self, tag: ModificationTag) {
		*self.tag.write().unwrap() = tag;
	}

	/// Whether `other` is strictly newer than this endpoint's stored tag.
	pub fn superseded_by(&self, other: &ModificationTag) -> bool {
		self.tag.read().unwrap().succeeded_by(other)
	}

	/// Registration-carried attributes, ignoring tag, TTL, and stats. Two
	/// equal registrations differ only in liveness.
	pub fn same_attributes(&self, other: &Endpoint) -> bool {
		self.tls == other.tls
			&& self.server_cert_domain_san == other.server_cert_domain_san
			&& self.app_id == other.app_id
			&& self.instance_index == other.instance_index
			&& self.protocol == other.protocol
			&& self.isolation_segment == other.isolation_segment
			&& self.tags == other.tags
	}

	pub fn hostport(&self) -> String {
		format!("{}:{}", self.id.host, self.id.port)
	}

	/// Extends the stale deadline; called on every accepted (re-)registration.
	pub fn refresh(&self, ttl: Duration) {
		self.stale_at.store(Instant::now() + ttl);
	}

	pub fn stale_at(&self) -> Instant {
		self.stale_at.load()
	}

	pub fn is_stale(&self, now: Instant) -> bool {
		self.stale_at.load() <= now
	}

	pub fn in_backoff(&self, now: Instant) -> bool {
		match self.stats.backoff_until.load() {
			Some(until) => until > now,
			None => false,
		}
	}

	/// Arms the failure back-off; the endpoint is skipped by selection until
	/// it expires or a round trip succeeds.
	pub fn mark_failed(&self, backoff: Duration) {
		self.stats.backoff_until.store(Some(Instant::now() + backoff));
	}

	pub fn record_success(&self) {
		self.stats.backoff_until.store(None);
		self.stats.last_used.store(Some(Instant::now()));
	}

	/// Bumps the active-request gauge for the lifetime of the returned guard.
	pub fn begin_request(self: &Arc<Self>) -> ActiveRequest {
		self.stats.active.fetch_add(1, Ordering::Relaxed);
		ActiveRequest(self.clone())
	}
}

pub struct ActiveRequest(Arc<Endpoint>);

impl Drop for ActiveRequest {
	fn drop(&mut self) {
		self.0.stats.active.fetch_sub(1, Ordering::Relaxed);
	}
}

impl Serialize for Endpoint {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		#[derive(Serialize)]
		struct Dump<'a> {
			address: String,
			tls: bool,
			app_id: &'a Strng,
			instance_id: &'a Strng,
			instance_index: &'a Strng,
			isolation_segment: &'a Strng,
			active_requests: usize,
		}
		Dump {
			address: self.hostport(),
			tls: self.tls,
			app_id: &self.app_id,
			instance_id: &self.id.instance_id,
			instance_index: &self.instance_index,
			isolation_segment: &self.isolation_segment,
			active_requests: self.stats.active_requests(),
		}
		.serialize(serializer)
	}
}

/// Canonical route key: lowercased host plus optional normalized path prefix.
/// Longest-prefix match wins at lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RouteKey {
	pub host: Strng,
	/// Normalized: leading `/`, no trailing `/`; empty when the key has no
	/// path component.
	pub path: Strng,
}

impl RouteKey {
	/// Parses a registration URI of the form `host[/path]`, lowercasing the
	/// host and normalizing the path.
	pub fn parse(uri: &str) -> RouteKey {
		let uri = uri.trim();
		let (host, path) = match uri.find('/') {
			Some(idx) => (&uri[..idx], &uri[idx..]),
			None => (uri, ""),
		};
		let host = host.to_ascii_lowercase();
		let path = path.trim_end_matches('/');
		RouteKey {
			host: strng::new(host),
			path: strng::new(path),
		}
	}

	/// True when `request_path` equals this key's path or extends it with a
	/// `/`-separated segment. A key with no path matches every path.
	pub fn matches_path(&self, request_path: &str) -> bool {
		if self.path.is_empty() {
			return true;
		}
		if let Some(rest) = request_path.strip_prefix(self.path.as_str()) {
			return rest.is_empty() || rest.starts_with('/');
		}
		false
	}
}

impl Display for RouteKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.path.is_empty() {
			write!(f, "{}", self.host)
		} else {
			write!(f, "{}{}", self.host, self.path)
		}
	}
}

/// TCP routes key by router group and externally reserved port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TcpRouteKey {
	pub router_group: Strng,
	pub external_port: u16,
}

impl Display for TcpRouteKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.router_group, self.external_port)
	}
}

/// A named set of externally reservable ports for TCP routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterGroup {
	pub guid: Strng,
	pub name: Strng,
	#[serde(default)]
	pub reservable_ports: Vec<PortRange>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRange {
	pub start: u16,
	pub end: u16,
}

impl RouterGroup {
	pub fn contains_port(&self, port: u16) -> bool {
		self
			.reservable_ports
			.iter()
			.any(|r| r.start <= port && port <= r.end)
	}
}

fn default_stale_threshold() -> u64 {
	120
}

/// Wire form of a registration, shared by the bus and REST feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationMessage {
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub tls_port: Option<u16>,
	#[serde(default)]
	pub uris: Vec<String>,
	#[serde(default)]
	pub app: String,
	#[serde(default)]
	pub private_instance_id: String,
	#[serde(default)]
	pub private_instance_index: String,
	#[serde(default)]
	pub server_cert_domain_san: Option<String>,
	#[serde(default = "default_stale_threshold")]
	pub stale_threshold_in_seconds: u64,
	#[serde(default)]
	pub router_group_guid: Option<String>,
	#[serde(default)]
	pub external_port: Option<u16>,
	#[serde(default)]
	pub isolation_segment: String,
	#[serde(default)]
	pub tags: BTreeMap<String, String>,
	#[serde(default)]
	pub route_service_url: Option<String>,
	#[serde(default)]
	pub protocol: Option<AppProtocol>,
	#[serde(default)]
	pub modification_tag: Option<ModificationTag>,
}

impl RegistrationMessage {
	pub fn ttl(&self) -> Duration {
		Duration::from_secs(self.stale_threshold_in_seconds.max(1))
	}

	/// Builds the endpoint this message describes. TLS backends advertise a
	/// dedicated `tls_port`, which supersedes the plain port.
	pub fn endpoint(&self) -> Endpoint {
		let (port, tls) = match self.tls_port {
			Some(p) => (p, true),
			None => (self.port, false),
		};
		let id = EndpointId {
			host: strng::new(&self.host),
			port,
			instance_id: strng::new(&self.private_instance_id),
		};
		let mut ep = Endpoint::new(id, self.ttl());
		ep.tls = tls;
		ep.server_cert_domain_san = self.server_cert_domain_san.as_deref().map(strng::new);
		ep.app_id = strng::new(&self.app);
		ep.instance_index = strng::new(&self.private_instance_index);
		ep.protocol = self.protocol.unwrap_or_default();
		ep.isolation_segment = strng::new(&self.isolation_segment);
		ep.tags = self
			.tags
			.iter()
			.map(|(k, v)| (strng::new(k), strng::new(v)))
			.collect();
		ep.set_tag(
			self
				.modification_tag
				.clone()
				.unwrap_or_else(ModificationTag::fresh),
		);
		ep
	}

	pub fn route_keys(&self) -> impl Iterator<Item = RouteKey> + '_ {
		self.uris.iter().map(|u| RouteKey::parse(u))
	}

	pub fn tcp_key(&self) -> Option<TcpRouteKey> {
		match (&self.router_group_guid, self.external_port) {
			(Some(group), Some(port)) => Some(TcpRouteKey {
				router_group: strng::new(group),
				external_port: port,
			}),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn modification_tag_ordering() {
		let base = ModificationTag {
			guid: strng::new("g"),
			index: 5,
		};
		assert!(base.succeeded_by(&ModificationTag {
			guid: strng::new("g"),
			index: 6,
		}));
		assert!(!base.succeeded_by(&ModificationTag {
			guid: strng::new("g"),
			index: 5,
		}));
		assert!(!base.succeeded_by(&ModificationTag {
			guid: strng::new("g"),
			index: 4,
		}));
		// A new guid always supersedes, regardless of index.
		assert!(base.succeeded_by(&ModificationTag {
			guid: strng::new("h"),
			index: 0,
		}));
	}

	#[test]
	fn route_key_parse_normalizes() {
		let k = RouteKey::parse("Foo.Example.COM/Some/Path/");
		assert_eq!(k.host.as_str(), "foo.example.com");
		assert_eq!(k.path.as_str(), "/Some/Path");

		let bare = RouteKey::parse("foo.example.com");
		assert_eq!(bare.path.as_str(), "");
		assert_eq!(bare.to_string(), "foo.example.com");
	}

	#[test]
	fn route_key_prefix_matching() {
		let k = RouteKey::parse("h/api/v1");
		assert!(k.matches_path("/api/v1"));
		assert!(k.matches_path("/api/v1/users"));
		assert!(!k.matches_path("/api/v10"));
		assert!(!k.matches_path("/api"));

		let root = RouteKey::parse("h");
		assert!(root.matches_path("/anything"));
	}

	#[test]
	fn registration_builds_tls_endpoint() {
		let msg: RegistrationMessage = serde_json::from_str(
			r#"{
				"host": "10.0.0.1",
				"port": 8080,
				"tls_port": 8443,
				"uris": ["app.example.com"],
				"app": "app-guid",
				"private_instance_id": "i-1",
				"server_cert_domain_san": "app.internal",
				"stale_threshold_in_seconds": 120,
				"tags": {"component": "router"}
			}"#,
		)
		.unwrap();
		let ep = msg.endpoint();
		assert!(ep.tls);
		assert_eq!(ep.id.port, 8443);
		assert_eq!(ep.server_cert_domain_san.as_deref(), Some("app.internal"));
		assert_eq!(msg.route_keys().count(), 1);
		assert!(msg.tcp_key().is_none());
	}
}
