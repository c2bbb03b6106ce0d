use std::path::PathBuf;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use router_core::prelude::*;
use rustls::ServerConfig;
use rustls::server::WebPkiClientVerifier;
use serde::Deserialize;

use crate::accesslog::{AccessLogConfig, QueryRedaction, syslog};
use crate::client::BackendConfig;
use crate::feeds::api::ApiConfig;
use crate::feeds::bus::BusConfig;
use crate::registry::{BalanceStrategy, PoolConfig, RegistryConfig};
use crate::routeservice::KeyringConfig;
use crate::types::RouterGroup;
use crate::{Config, ForwardedClientCert, TlsListener};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
	#[serde(default)]
	listen: RawListen,
	#[serde(default)]
	timeouts: RawTimeouts,
	#[serde(default)]
	drain: RawDrain,
	#[serde(default)]
	balance: RawBalance,
	#[serde(default)]
	registry: RawRegistry,
	#[serde(default)]
	connections: RawConnections,
	#[serde(default)]
	bus: Option<RawBus>,
	#[serde(default)]
	routing_api: Option<RawRoutingApi>,
	#[serde(default)]
	route_services: Option<RawRouteServices>,
	#[serde(default)]
	access_log: RawAccessLog,
	#[serde(default)]
	health_check_user_agent: Option<String>,
	#[serde(default)]
	forwarded_client_cert: Option<ForwardedClientCert>,
	#[serde(default)]
	xff_append: Option<bool>,
	#[serde(default)]
	router_groups: Vec<RouterGroup>,
	#[serde(default)]
	worker_threads: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawListen {
	http: Option<String>,
	tls: Option<RawTlsListen>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTlsListen {
	#[serde(default)]
	address: Option<String>,
	cert: PathBuf,
	key: PathBuf,
	#[serde(default)]
	client_ca: Option<PathBuf>,
	#[serde(default)]
	request_client_cert: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTimeouts {
	endpoint_dial: Option<u64>,
	endpoint_response: Option<u64>,
	tls_handshake: Option<u64>,
	websocket_dial: Option<u64>,
	read_header: Option<u64>,
	frontend_idle: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDrain {
	grace: Option<u64>,
	timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBalance {
	strategy: Option<BalanceStrategy>,
	locally_optimistic: Option<bool>,
	isolation_segment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRegistry {
	prune_interval: Option<u64>,
	suspend_pruning_on_bus_outage: Option<bool>,
	empty_pool_grace: Option<u64>,
	event_buffer: Option<usize>,
	max_retries: Option<usize>,
	failure_backoff: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConnections {
	max_idle: Option<usize>,
	max_idle_per_host: Option<usize>,
	idle_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBus {
	servers: Vec<String>,
	advertise_interval: Option<u64>,
	min_register_interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRoutingApi {
	url: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRouteServices {
	/// Base64, 32 bytes each; newest first.
	keys: Vec<String>,
	timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAccessLog {
	file: Option<PathBuf>,
	syslog: Option<syslog::SyslogConfig>,
	envelope: Option<bool>,
	redact_query: Option<QueryRedaction>,
	extra_headers: Option<Vec<String>>,
	attempt_details: Option<bool>,
	capacity: Option<usize>,
}

fn secs(v: Option<u64>, default: u64) -> Duration {
	Duration::from_secs(v.unwrap_or(default))
}

/// Parses the YAML config file into the resolved process configuration.
/// Every failure here is a configuration error (exit code 1).
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let raw: RawConfig = serde_yaml::from_str(contents).context("invalid config file")?;

	let http_addr: SocketAddr = raw
		.listen
		.http
		.as_deref()
		.unwrap_or("0.0.0.0:8080")
		.parse()
		.context("invalid http listen address")?;

	let tls = match raw.listen.tls {
		Some(t) => Some(load_tls_listener(t)?),
		None => None,
	};

	let dial_timeout = secs(raw.timeouts.endpoint_dial, 5);
	let backend = BackendConfig {
		dial_timeout,
		response_timeout: secs(raw.timeouts.endpoint_response, 60),
		tls_handshake_timeout: secs(raw.timeouts.tls_handshake, 10),
		websocket_dial_timeout: raw
			.timeouts
			.websocket_dial
			.map(Duration::from_secs)
			.unwrap_or(dial_timeout),
		max_attempts: raw.registry.max_retries.unwrap_or(3).max(1),
		max_idle_conns: raw.connections.max_idle.unwrap_or(100),
		max_idle_conns_per_host: raw.connections.max_idle_per_host.unwrap_or(10),
		idle_conn_timeout: secs(raw.connections.idle_timeout, 90),
	};

	let prune_interval = secs(raw.registry.prune_interval, 30);
	let registry = RegistryConfig {
		prune_interval,
		suspend_pruning_on_bus_outage: raw.registry.suspend_pruning_on_bus_outage.unwrap_or(false),
		empty_pool_grace: raw
			.registry
			.empty_pool_grace
			.map(Duration::from_secs)
			.unwrap_or(prune_interval * 2),
		event_buffer: raw.registry.event_buffer.unwrap_or(1024),
		pool: PoolConfig {
			strategy: raw.balance.strategy.unwrap_or_default(),
			locally_optimistic: raw.balance.locally_optimistic.unwrap_or(false),
			local_segment: raw
				.balance
				.isolation_segment
				.as_deref()
				.map(strng::new)
				.unwrap_or(strng::EMPTY),
			max_attempts: raw.registry.max_retries.unwrap_or(3).max(1),
			failure_backoff: secs(raw.registry.failure_backoff, 30),
		},
	};

	let bus = raw.bus.map(|b| BusConfig {
		servers: b.servers,
		advertise_interval: secs(b.advertise_interval, 30),
		min_register_interval: secs(b.min_register_interval, 20),
		prune_threshold: prune_interval * 4,
	});

	let routing_api = raw.routing_api.map(|r| ApiConfig { url: r.url });

	let route_service = match raw.route_services {
		Some(rs) => {
			anyhow::ensure!(!rs.keys.is_empty(), "route_services.keys must not be empty");
			let keys = rs
				.keys
				.iter()
				.map(|k| {
					let raw = BASE64
						.decode(k)
						.context("route service key is not valid base64")?;
					let key: [u8; 32] = raw
						.try_into()
						.map_err(|_| anyhow::anyhow!("route service key must be 32 bytes"))?;
					Ok(key)
				})
				.collect::<anyhow::Result<Vec<_>>>()?;
			Some(KeyringConfig {
				keys,
				signature_timeout: secs(rs.timeout, 60),
			})
		},
		None => None,
	};

	let access_log = AccessLogConfig {
		file: raw.access_log.file,
		syslog: raw.access_log.syslog,
		envelope: raw.access_log.envelope.unwrap_or(false),
		redact_query: raw.access_log.redact_query.unwrap_or_default(),
		extra_headers: raw
			.access_log
			.extra_headers
			.unwrap_or_default()
			.iter()
			.map(strng::new)
			.collect(),
		attempt_details: raw.access_log.attempt_details.unwrap_or(false),
		capacity: raw.access_log.capacity.unwrap_or(1024),
	};

	Ok(Config {
		http_addr,
		tls,
		read_header_timeout: secs(raw.timeouts.read_header, 60),
		frontend_idle_timeout: secs(raw.timeouts.frontend_idle, 900),
		drain_grace: secs(raw.drain.grace, 0),
		drain_timeout: secs(raw.drain.timeout, 30),
		num_worker_threads: worker_threads(raw.worker_threads)?,
		backend,
		registry,
		bus,
		routing_api,
		route_service,
		access_log,
		health_check_user_agent: raw
			.health_check_user_agent
			.as_deref()
			.map(strng::new)
			.unwrap_or_else(|| strng::literal!("HTTP-Monitor/1.1")),
		forwarded_client_cert: raw.forwarded_client_cert.unwrap_or_default(),
		xff_append: raw.xff_append.unwrap_or(true),
		router_groups: raw.router_groups,
	})
}

fn load_tls_listener(raw: RawTlsListen) -> anyhow::Result<TlsListener> {
	let addr: SocketAddr = raw
		.address
		.as_deref()
		.unwrap_or("0.0.0.0:443")
		.parse()
		.context("invalid tls listen address")?;

	let cert_pem = std::fs::read(&raw.cert)
		.with_context(|| format!("read cert {}", raw.cert.display()))?;
	let key_pem =
		std::fs::read(&raw.key).with_context(|| format!("read key {}", raw.key.display()))?;
	let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
		.collect::<Result<Vec<_>, _>>()
		.context("parse certificate chain")?;
	anyhow::ensure!(!certs.is_empty(), "certificate file contains no certificates");
	let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
		.context("parse private key")?
		.ok_or_else(|| anyhow::anyhow!("key file contains no private key"))?;

	let builder = ServerConfig::builder();
	let server_config = if raw.request_client_cert {
		let ca_path = raw
			.client_ca
			.as_ref()
			.ok_or_else(|| anyhow::anyhow!("request_client_cert requires client_ca"))?;
		let ca_pem =
			std::fs::read(ca_path).with_context(|| format!("read client ca {}", ca_path.display()))?;
		let mut roots = rustls::RootCertStore::empty();
		for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
			roots.add(cert.context("parse client ca certificate")?)?;
		}
		let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
			.allow_unauthenticated()
			.build()
			.context("build client verifier")?;
		builder
			.with_client_cert_verifier(verifier)
			.with_single_cert(certs, key)
			.context("build tls config")?
	} else {
		builder
			.with_no_client_auth()
			.with_single_cert(certs, key)
			.context("build tls config")?
	};

	Ok(TlsListener {
		addr,
		server_config: Arc::new(server_config),
		request_client_cert: raw.request_client_cert,
	})
}

fn worker_threads(configured: Option<usize>) -> anyhow::Result<usize> {
	if let Some(n) = parse_env::<usize>("WORKER_THREADS")? {
		return Ok(n.max(1));
	}
	Ok(
		configured
			.unwrap_or_else(|| std::thread::available_parallelism().map(usize::from).unwrap_or(4))
			.max(1),
	)
}

fn parse_env<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match std::env::var(env) {
		Ok(val) => val.parse().map(Some).map_err(|e: <T as FromStr>::Err| {
			anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
		}),
		Err(_) => Ok(None),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_config_gets_defaults() {
		let cfg = parse_config("{}").unwrap();
		assert_eq!(cfg.http_addr.port(), 8080);
		assert!(cfg.tls.is_none());
		assert_eq!(cfg.backend.dial_timeout, Duration::from_secs(5));
		assert_eq!(cfg.backend.response_timeout, Duration::from_secs(60));
		assert_eq!(cfg.backend.max_attempts, 3);
		assert_eq!(cfg.registry.prune_interval, Duration::from_secs(30));
		assert_eq!(cfg.access_log.capacity, 1024);
		assert_eq!(cfg.health_check_user_agent.as_str(), "HTTP-Monitor/1.1");
		assert!(cfg.xff_append);
		assert!(cfg.bus.is_none());
	}

	#[test]
	fn full_config_parses() {
		let yaml = r#"
listen:
  http: "127.0.0.1:9080"
timeouts:
  endpoint_dial: 2
  endpoint_response: 15
drain:
  grace: 5
  timeout: 20
balance:
  strategy: least-connection
  locally_optimistic: true
  isolation_segment: az1
registry:
  prune_interval: 10
  suspend_pruning_on_bus_outage: true
  max_retries: 2
bus:
  servers: ["nats://127.0.0.1:4222"]
  advertise_interval: 15
routing_api:
  url: "http://routing-api.internal:3000"
route_services:
  keys: ["AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="]
  timeout: 30
access_log:
  redact_query: hash
  extra_headers: ["X-Request-Start"]
  attempt_details: true
health_check_user_agent: "LB-Check/1.0"
forwarded_client_cert: sanitize_set
"#;
		let cfg = parse_config(yaml).unwrap();
		assert_eq!(cfg.http_addr.port(), 9080);
		assert_eq!(cfg.backend.dial_timeout, Duration::from_secs(2));
		assert_eq!(cfg.drain_grace, Duration::from_secs(5));
		assert_eq!(cfg.registry.pool.strategy, BalanceStrategy::LeastConnection);
		assert!(cfg.registry.pool.locally_optimistic);
		assert_eq!(cfg.registry.pool.local_segment.as_str(), "az1");
		assert_eq!(cfg.backend.max_attempts, 2);
		assert!(cfg.registry.suspend_pruning_on_bus_outage);
		let bus = cfg.bus.unwrap();
		assert_eq!(bus.advertise_interval, Duration::from_secs(15));
		let rs = cfg.route_service.unwrap();
		assert_eq!(rs.keys.len(), 1);
		assert_eq!(rs.signature_timeout, Duration::from_secs(30));
		assert_eq!(cfg.access_log.redact_query, QueryRedaction::Hash);
		assert!(cfg.access_log.attempt_details);
		assert_eq!(cfg.forwarded_client_cert, ForwardedClientCert::SanitizeSet);
	}

	#[test]
	fn short_route_service_key_rejected() {
		let yaml = r#"
route_services:
  keys: ["c2hvcnQ="]
"#;
		let err = parse_config(yaml).unwrap_err();
		assert!(err.to_string().contains("32 bytes"));
	}

	#[test]
	fn invalid_yaml_rejected() {
		assert!(parse_config("listen: [not a map").is_err());
		assert!(parse_config("unknown_key: true").is_err());
	}
}
