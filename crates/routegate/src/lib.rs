pub mod accesslog;
pub mod app;
pub mod client;
pub mod config;
pub mod feeds;
pub mod http;
pub mod proxy;
pub mod registry;
pub mod routeservice;
pub mod telemetry;
pub mod types;

use router_core::prelude::*;
pub use router_core::strng;
pub use router_core::strng::Strng;
use tokio::sync::watch;

use crate::registry::Registry;
use crate::telemetry::metrics::Metrics;

/// Policy for the X-Forwarded-Client-Cert header on proxied requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardedClientCert {
	/// Pass the header through untouched.
	AlwaysForward,
	/// Pass the header through only on mTLS connections, strip otherwise.
	#[default]
	Forward,
	/// Strip the header and replace it with the connection's client leaf
	/// certificate when one was presented.
	SanitizeSet,
}

/// Resolved process configuration. Built from the YAML file by
/// [`config::parse_config`]; every field has a default.
#[derive(Debug, Clone)]
pub struct Config {
	pub http_addr: SocketAddr,
	pub tls: Option<TlsListener>,
	pub read_header_timeout: Duration,
	pub frontend_idle_timeout: Duration,
	/// After a drain begins, new requests are still served for this long
	/// before being refused with 503.
	pub drain_grace: Duration,
	/// Hard deadline for in-flight work once a drain begins.
	pub drain_timeout: Duration,
	pub num_worker_threads: usize,

	pub backend: client::BackendConfig,
	pub registry: registry::RegistryConfig,
	pub bus: Option<feeds::bus::BusConfig>,
	pub routing_api: Option<feeds::api::ApiConfig>,
	pub route_service: Option<routeservice::KeyringConfig>,
	pub access_log: accesslog::AccessLogConfig,

	pub health_check_user_agent: Strng,
	pub forwarded_client_cert: ForwardedClientCert,
	/// Append the peer address to X-Forwarded-For (on by default).
	pub xff_append: bool,
	pub router_groups: Vec<types::RouterGroup>,
}

#[derive(Debug, Clone)]
pub struct TlsListener {
	pub addr: SocketAddr,
	pub server_config: Arc<rustls::ServerConfig>,
	pub request_client_cert: bool,
}

/// Everything a request task needs, threaded explicitly rather than held in
/// globals. Cheap to clone behind an Arc.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub registry: Arc<Registry>,
	pub metrics: Arc<Metrics>,
	pub backends: client::BackendClient,
	pub access_log: accesslog::Pipeline,
	pub route_services: Option<Arc<routeservice::Keyring>>,
	/// Flips to true once the drain grace interval has elapsed; new requests
	/// are then refused with 503.
	pub draining: watch::Receiver<bool>,
}

/// Per-connection attributes captured at accept time and surfaced to the
/// request pipeline through an Arc.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
	pub peer_addr: SocketAddr,
	pub local_addr: SocketAddr,
	pub tls: Option<TlsConnectionInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct TlsConnectionInfo {
	pub server_name: Option<String>,
	/// PEM-encoded client leaf certificate, when one was presented.
	pub client_cert_pem: Option<String>,
}
