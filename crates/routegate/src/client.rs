use std::collections::{HashMap, VecDeque};

use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use router_core::prelude::*;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::http::Body;
use crate::types::{AppProtocol, Endpoint};

#[derive(Debug, Clone)]
pub struct BackendConfig {
	pub dial_timeout: Duration,
	pub response_timeout: Duration,
	pub tls_handshake_timeout: Duration,
	pub websocket_dial_timeout: Duration,
	/// Ceiling on per-request round-trip attempts.
	pub max_attempts: usize,
	pub max_idle_conns: usize,
	pub max_idle_conns_per_host: usize,
	pub idle_conn_timeout: Duration,
}

impl Default for BackendConfig {
	fn default() -> Self {
		let dial_timeout = Duration::from_secs(5);
		BackendConfig {
			dial_timeout,
			response_timeout: Duration::from_secs(60),
			tls_handshake_timeout: Duration::from_secs(10),
			websocket_dial_timeout: dial_timeout,
			max_attempts: 3,
			max_idle_conns: 100,
			max_idle_conns_per_host: 10,
			idle_conn_timeout: Duration::from_secs(90),
		}
	}
}

/// Classified connection-establishment failure. Everything here happens
/// before any request byte is written, so all variants are retryable.
#[derive(thiserror::Error, Debug)]
pub enum DialError {
	#[error("dns resolution failed: {0}")]
	Resolve(String),
	#[error("dial timed out")]
	Timeout,
	#[error("connect failed: {0}")]
	Connect(String),
	#[error("tls handshake timed out")]
	TlsTimeout,
	#[error("tls handshake failed: {0}")]
	Tls(String),
	#[error("http handshake failed: {0}")]
	Handshake(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DialTimings {
	pub dns: Option<Duration>,
	pub dial: Option<Duration>,
	pub tls: Option<Duration>,
	pub reused: bool,
}

/// Where to connect, independent of how the route was found.
#[derive(Debug, Clone)]
pub struct DialTarget {
	pub host: Strng,
	pub port: u16,
	pub tls: bool,
	/// Expected server identity; defaults to `host`.
	pub server_name: Option<Strng>,
	pub http2: bool,
}

impl From<&Endpoint> for DialTarget {
	fn from(ep: &Endpoint) -> Self {
		DialTarget {
			host: ep.id.host.clone(),
			port: ep.id.port,
			tls: ep.tls,
			server_name: ep.server_cert_domain_san.clone(),
			http2: ep.protocol == AppProtocol::Http2,
		}
	}
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct PoolKey {
	host: Strng,
	port: u16,
	tls: bool,
	http2: bool,
}

impl PoolKey {
	fn of(t: &DialTarget) -> PoolKey {
		PoolKey {
			host: t.host.clone(),
			port: t.port,
			tls: t.tls,
			http2: t.http2,
		}
	}
}

#[derive(Debug)]
enum Sender {
	H1(http1::SendRequest<Body>),
	H2(http2::SendRequest<Body>),
}

/// A ready-to-use backend connection. HTTP/1.1 handles go back to the idle
/// pool via `checkin`; HTTP/2 handles are shared and multiplexed.
#[derive(Debug)]
pub struct Connection {
	sender: Sender,
	key: PoolKey,
}

impl Connection {
	pub fn is_http2(&self) -> bool {
		matches!(self.sender, Sender::H2(_))
	}

	pub async fn send(
		&mut self,
		req: ::http::Request<Body>,
	) -> Result<::http::Response<Incoming>, hyper::Error> {
		match &mut self.sender {
			Sender::H1(s) => s.send_request(req).await,
			Sender::H2(s) => s.send_request(req).await,
		}
	}
}

struct IdleConn {
	sender: http1::SendRequest<Body>,
	since: Instant,
}

#[derive(Default)]
struct PoolState {
	idle: HashMap<PoolKey, VecDeque<IdleConn>>,
	total: usize,
	h2: HashMap<PoolKey, http2::SendRequest<Body>>,
}

/// Dials backends and reuses connections. Idle HTTP/1.1 connections are
/// bounded globally and per destination; exhaustion of a budget just forces
/// a fresh dial.
#[derive(Clone)]
pub struct BackendClient {
	inner: Arc<ClientInner>,
}

struct ClientInner {
	cfg: BackendConfig,
	tls: TlsConnector,
	pool: Mutex<PoolState>,
}

impl BackendClient {
	pub fn new(cfg: BackendConfig) -> BackendClient {
		let mut roots = rustls::RootCertStore::empty();
		let native = rustls_native_certs::load_native_certs();
		for err in &native.errors {
			warn!("failed loading a native root cert: {err}");
		}
		for cert in native.certs {
			let _ = roots.add(cert);
		}
		let tls_config = rustls::ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();
		BackendClient {
			inner: Arc::new(ClientInner {
				cfg,
				tls: TlsConnector::from(Arc::new(tls_config)),
				pool: Mutex::new(PoolState::default()),
			}),
		}
	}

	pub fn config(&self) -> &BackendConfig {
		&self.inner.cfg
	}

	/// Returns a connection to the target, reusing an idle or multiplexed one
	/// when possible. `dial_timeout` overrides the configured dial timeout
	/// (the websocket path uses its own).
	pub async fn checkout(
		&self,
		target: &DialTarget,
		dial_timeout: Option<Duration>,
	) -> Result<(Connection, DialTimings), DialError> {
		let key = PoolKey::of(target);
		if target.http2 {
			if let Some(sender) = self.pooled_h2(&key) {
				return Ok((
					Connection {
						sender: Sender::H2(sender),
						key,
					},
					DialTimings {
						reused: true,
						..Default::default()
					},
				));
			}
		} else if let Some(sender) = self.pooled_h1(&key) {
			return Ok((
				Connection {
					sender: Sender::H1(sender),
					key,
				},
				DialTimings {
					reused: true,
					..Default::default()
				},
			));
		}
		self
			.dial(target, key, dial_timeout.unwrap_or(self.inner.cfg.dial_timeout))
			.await
	}

	/// Returns an HTTP/1.1 connection to the idle pool. Hyper gates reuse on
	/// the sender becoming ready again, so immediate checkin is safe even
	/// while the response body is still streaming.
	pub fn checkin(&self, conn: Connection) {
		let Connection { sender, key } = conn;
		let Sender::H1(sender) = sender else {
			// H2 handles stay in the shared map.
			return;
		};
		if sender.is_closed() {
			return;
		}
		let cfg = &self.inner.cfg;
		let mut pool = self.inner.pool.lock().unwrap();
		if pool.total >= cfg.max_idle_conns {
			return;
		}
		let idle = pool.idle.entry(key).or_default();
		if idle.len() >= cfg.max_idle_conns_per_host {
			return;
		}
		idle.push_back(IdleConn {
			sender,
			since: Instant::now(),
		});
		pool.total += 1;
	}

	fn pooled_h1(&self, key: &PoolKey) -> Option<http1::SendRequest<Body>> {
		let idle_timeout = self.inner.cfg.idle_conn_timeout;
		let mut pool = self.inner.pool.lock().unwrap();
		let deque = pool.idle.get_mut(key)?;
		let mut found = None;
		let mut keep = VecDeque::with_capacity(deque.len());
		while let Some(conn) = deque.pop_front() {
			if conn.sender.is_closed() || conn.since.elapsed() >= idle_timeout {
				continue;
			}
			if found.is_none() && conn.sender.is_ready() {
				found = Some(conn.sender);
				continue;
			}
			keep.push_back(conn);
		}
		*deque = keep;
		if deque.is_empty() {
			pool.idle.remove(key);
		}
		pool.total = recount(&pool.idle);
		found
	}

	fn pooled_h2(&self, key: &PoolKey) -> Option<http2::SendRequest<Body>> {
		let mut pool = self.inner.pool.lock().unwrap();
		match pool.h2.get(key) {
			Some(s) if !s.is_closed() => Some(s.clone()),
			Some(_) => {
				pool.h2.remove(key);
				None
			},
			None => None,
		}
	}

	async fn dial(
		&self,
		target: &DialTarget,
		key: PoolKey,
		dial_timeout: Duration,
	) -> Result<(Connection, DialTimings), DialError> {
		let mut timings = DialTimings::default();
		let cfg = &self.inner.cfg;

		let t0 = Instant::now();
		let addr = {
			let hostport = format!("{}:{}", target.host, target.port);
			let mut addrs = tokio::time::timeout(dial_timeout, tokio::net::lookup_host(hostport))
				.await
				.map_err(|_| DialError::Timeout)?
				.map_err(|e| DialError::Resolve(e.to_string()))?;
			addrs.next().ok_or_else(|| {
				DialError::Resolve(format!("{} resolved to no addresses", target.host))
			})?
		};
		timings.dns = Some(t0.elapsed());

		let t1 = Instant::now();
		let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| DialError::Timeout)?
			.map_err(|e| DialError::Connect(e.to_string()))?;
		let _ = stream.set_nodelay(true);
		timings.dial = Some(t1.elapsed());

		if target.tls {
			let t2 = Instant::now();
			let name = target
				.server_name
				.clone()
				.unwrap_or_else(|| target.host.clone());
			let server_name = ServerName::try_from(name.to_string())
				.map_err(|e| DialError::Tls(format!("invalid server name {name}: {e}")))?;
			let tls_stream = tokio::time::timeout(
				cfg.tls_handshake_timeout,
				self.inner.tls.connect(server_name, stream),
			)
			.await
			.map_err(|_| DialError::TlsTimeout)?
			.map_err(|e| DialError::Tls(e.to_string()))?;
			timings.tls = Some(t2.elapsed());
			self.handshake(target, key, TokioIo::new(tls_stream), timings).await
		} else {
			self.handshake(target, key, TokioIo::new(stream), timings).await
		}
	}

	async fn handshake<I>(
		&self,
		target: &DialTarget,
		key: PoolKey,
		io: I,
		timings: DialTimings,
	) -> Result<(Connection, DialTimings), DialError>
	where
		I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
	{
		if target.http2 {
			let (sender, conn) = http2::Builder::new(TokioExecutor::new())
				.timer(TokioTimer::new())
				.handshake::<_, Body>(io)
				.await
				.map_err(|e| DialError::Handshake(e.to_string()))?;
			tokio::spawn(async move {
				if let Err(e) = conn.await {
					trace!("backend h2 connection ended: {e}");
				}
			});
			self
				.inner
				.pool
				.lock()
				.unwrap()
				.h2
				.insert(key.clone(), sender.clone());
			Ok((
				Connection {
					sender: Sender::H2(sender),
					key,
				},
				timings,
			))
		} else {
			let (sender, conn) = http1::Builder::new()
				.handshake::<_, Body>(io)
				.await
				.map_err(|e| DialError::Handshake(e.to_string()))?;
			tokio::spawn(async move {
				if let Err(e) = conn.with_upgrades().await {
					trace!("backend connection ended: {e}");
				}
			});
			Ok((
				Connection {
					sender: Sender::H1(sender),
					key,
				},
				timings,
			))
		}
	}

	/// Plain TCP dial for TCP routes and spliced tunnels.
	pub async fn dial_tcp(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
		let dial_timeout = self.inner.cfg.dial_timeout;
		let hostport = format!("{host}:{port}");
		let mut addrs = tokio::time::timeout(dial_timeout, tokio::net::lookup_host(hostport))
			.await
			.map_err(|_| DialError::Timeout)?
			.map_err(|e| DialError::Resolve(e.to_string()))?;
		let addr = addrs
			.next()
			.ok_or_else(|| DialError::Resolve(format!("{host} resolved to no addresses")))?;
		let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| DialError::Timeout)?
			.map_err(|e| DialError::Connect(e.to_string()))?;
		let _ = stream.set_nodelay(true);
		Ok(stream)
	}
}

fn recount(idle: &HashMap<PoolKey, VecDeque<IdleConn>>) -> usize {
	idle.values().map(VecDeque::len).sum()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn target(port: u16) -> DialTarget {
		DialTarget {
			host: strng::new("127.0.0.1"),
			port,
			tls: false,
			server_name: None,
			http2: false,
		}
	}

	#[tokio::test]
	async fn refused_connection_classified_as_connect() {
		let client = BackendClient::new(BackendConfig::default());
		// Bind then drop to find a port nothing listens on.
		let port = {
			let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
			l.local_addr().unwrap().port()
		};
		let err = client.checkout(&target(port), None).await.unwrap_err();
		assert!(matches!(err, DialError::Connect(_)));
	}

	#[tokio::test]
	async fn dial_timeout_respected() {
		let client = BackendClient::new(BackendConfig {
			dial_timeout: Duration::from_millis(50),
			..Default::default()
		});
		// Unresolvable name forces the timeout/resolve path.
		let t = DialTarget {
			host: strng::new("host.invalid"),
			port: 80,
			tls: false,
			server_name: None,
			http2: false,
		};
		let err = client.checkout(&t, None).await.unwrap_err();
		assert!(matches!(err, DialError::Timeout | DialError::Resolve(_)));
	}

	#[tokio::test]
	async fn idle_pool_bounded_per_host() {
		let client = BackendClient::new(BackendConfig {
			max_idle_conns_per_host: 1,
			..Default::default()
		});
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		tokio::spawn(async move {
			loop {
				let Ok((s, _)) = listener.accept().await else {
					return;
				};
				// Hold the socket open.
				tokio::spawn(async move {
					let _s = s;
					tokio::time::sleep(Duration::from_secs(5)).await;
				});
			}
		});

		let (c1, t1) = client.checkout(&target(port), None).await.unwrap();
		assert!(!t1.reused);
		let (c2, t2) = client.checkout(&target(port), None).await.unwrap();
		assert!(!t2.reused);
		client.checkin(c1);
		client.checkin(c2);
		// Per-host budget of one: only a single idle conn was kept.
		assert_eq!(recount(&client.inner.pool.lock().unwrap().idle), 1);

		let (_c3, t3) = client.checkout(&target(port), None).await.unwrap();
		assert!(t3.reused);
	}
}
