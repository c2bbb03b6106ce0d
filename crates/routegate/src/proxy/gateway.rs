use std::collections::HashMap;
use std::convert::Infallible;

use futures_util::{FutureExt, StreamExt};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use router_core::drain::{DrainUpgrader, DrainWatcher};
use router_core::prelude::*;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};

use crate::proxy::httpproxy::HTTPProxy;
use crate::proxy::tcpproxy::TCPProxy;
use crate::registry::{EventAction, RouteAddress};
use crate::types::TcpRouteKey;
use crate::{Config, ConnectionInfo, ProxyInputs, TlsConnectionInfo};

/// Listener sockets, bound before the process commits to running so a bind
/// failure can abort startup with a distinct exit code.
pub struct BoundListeners {
	http: TcpListener,
	tls: Option<(TcpListener, Arc<ServerConfig>)>,
}

impl BoundListeners {
	pub async fn bind(cfg: &Config) -> anyhow::Result<BoundListeners> {
		let http = TcpListener::bind(cfg.http_addr)
			.await
			.with_context(|| format!("bind {}", cfg.http_addr))?;
		let tls = match &cfg.tls {
			Some(tls_cfg) => {
				let l = TcpListener::bind(tls_cfg.addr)
					.await
					.with_context(|| format!("bind {}", tls_cfg.addr))?;
				Some((l, tls_cfg.server_config.clone()))
			},
			None => None,
		};
		Ok(BoundListeners { http, tls })
	}

	pub fn http_addr(&self) -> SocketAddr {
		self.http.local_addr().expect("listener has an address")
	}
}

pub struct Gateway {
	pi: Arc<ProxyInputs>,
	drain: DrainWatcher,
	draining_tx: watch::Sender<bool>,
	listeners: BoundListeners,
}

impl Gateway {
	pub fn new(
		pi: Arc<ProxyInputs>,
		drain: DrainWatcher,
		draining_tx: watch::Sender<bool>,
		listeners: BoundListeners,
	) -> Gateway {
		Gateway {
			pi,
			drain,
			draining_tx,
			listeners,
		}
	}

	pub async fn run(self) {
		let Gateway {
			pi,
			drain,
			draining_tx,
			listeners,
		} = self;

		// After the grace interval of a drain, new requests get 503 while
		// in-flight work keeps running toward the hard deadline.
		{
			let grace = pi.cfg.drain_grace;
			let watcher = drain.clone();
			tokio::spawn(async move {
				let blocker = watcher.wait_for_drain().await;
				drop(blocker);
				tokio::time::sleep(grace).await;
				let _ = draining_tx.send(true);
			});
		}

		let mut js = JoinSet::new();
		let BoundListeners { http, tls } = listeners;
		js.spawn(Self::run_http_listener(
			pi.clone(),
			drain.clone(),
			http,
			None,
		));
		if let Some((listener, server_config)) = tls {
			js.spawn(Self::run_http_listener(
				pi.clone(),
				drain.clone(),
				listener,
				Some(server_config),
			));
		}
		js.spawn(Self::reconcile_tcp_routes(pi.clone(), drain.clone()));

		while let Some(res) = js.join_next().await {
			if let Err(e) = res {
				warn!("listener task failed: {e}");
			}
		}
		info!("all listeners stopped");
	}

	/// Accept loop for one HTTP(S) listener. Holds only a weak drain watcher
	/// so listening forever does not wedge shutdown; each accepted connection
	/// is upgraded to a strong blocker.
	async fn run_http_listener(
		pi: Arc<ProxyInputs>,
		drain: DrainWatcher,
		listener: TcpListener,
		tls: Option<Arc<ServerConfig>>,
	) {
		let addr = listener.local_addr().expect("listener has an address");
		let scheme = if tls.is_some() { "https" } else { "http" };
		info!(%addr, scheme, "listener started");
		let deadline = pi.cfg.drain_timeout;
		let accept = async |drain: DrainWatcher, force_shutdown: watch::Receiver<()>| {
			let drain_watch = drain.clone();
			let (mut upgrader, weak) = drain.into_weak();
			let handle_stream = |stream: TcpStream, peer: SocketAddr, upgrader: &DrainUpgrader| {
				let pi = pi.clone();
				let conn_drain = upgrader.upgrade(weak.clone());
				let tls = tls.clone();
				let mut force_shutdown = force_shutdown.clone();
				tokio::spawn(async move {
					let started = Instant::now();
					debug!(%peer, "connection opened");
					tokio::select! {
						_ = force_shutdown.changed() => {
							info!(%peer, "connection forcefully terminated");
						}
						_ = Self::serve_connection(pi, conn_drain, stream, peer, tls) => {}
					}
					debug!(%peer, dur = ?started.elapsed(), "connection closed");
				});
			};
			let wait = drain_watch.wait_for_drain();
			tokio::pin!(wait);
			let blocker = loop {
				tokio::select! {
					accepted = listener.accept() => {
						match accepted {
							Ok((stream, peer)) => handle_stream(stream, peer, &upgrader),
							Err(e) => {
								warn!(%addr, "accept failed: {e}");
								tokio::time::sleep(Duration::from_millis(50)).await;
							},
						}
					}
					res = &mut wait => break res,
				}
			};
			drop(blocker);
			// Clients do not stop connecting the instant a drain starts. Keep
			// accepting through the grace window; these late connections do not
			// block drain completion and are cut at the force deadline.
			upgrader.disable();
			info!(%addr, "drain started, accepting through the grace window");
			let grace_sleep = tokio::time::sleep(pi.cfg.drain_grace);
			tokio::pin!(grace_sleep);
			loop {
				tokio::select! {
					accepted = listener.accept() => {
						if let Ok((stream, peer)) = accepted {
							handle_stream(stream, peer, &upgrader);
						}
					}
					_ = &mut grace_sleep => break,
				}
			}
			info!(%addr, "listener stopped accepting");
			// In-flight work now governs shutdown; hold here until the deadline
			// machinery fires rather than cutting the drain short.
			let mut force = force_shutdown.clone();
			let _ = force.changed().await;
		};
		router_core::drain::run_with_drain(format!("listener {addr}"), drain, deadline, accept).await;
	}

	async fn serve_connection(
		pi: Arc<ProxyInputs>,
		drain: DrainWatcher,
		stream: TcpStream,
		peer: SocketAddr,
		tls: Option<Arc<ServerConfig>>,
	) {
		let local_addr = stream.local_addr().unwrap_or(peer);
		let _ = stream.set_nodelay(true);
		match tls {
			None => {
				let info = ConnectionInfo {
					peer_addr: peer,
					local_addr,
					tls: None,
				};
				Self::serve_http(pi, drain, stream, info, false).await;
			},
			Some(config) => {
				let timeout = pi.cfg.backend.tls_handshake_timeout;
				let acceptor = tokio_rustls::TlsAcceptor::from(config);
				let accepted = tokio::time::timeout(timeout, acceptor.accept(stream)).await;
				let tls_stream = match accepted {
					Ok(Ok(s)) => s,
					Ok(Err(e)) => {
						debug!(%peer, "tls handshake failed: {e}");
						return;
					},
					Err(_) => {
						debug!(%peer, "tls handshake timed out");
						return;
					},
				};
				let session = tls_stream.get_ref().1;
				let info = ConnectionInfo {
					peer_addr: peer,
					local_addr,
					tls: Some(TlsConnectionInfo {
						server_name: session.server_name().map(str::to_string),
						client_cert_pem: session
							.peer_certificates()
							.and_then(|certs| certs.first())
							.map(|der| pem_encode(der.as_ref())),
					}),
				};
				Self::serve_http(pi, drain, tls_stream, info, true).await;
			},
		}
	}

	async fn serve_http<I>(
		pi: Arc<ProxyInputs>,
		drain: DrainWatcher,
		io: I,
		info: ConnectionInfo,
		tls_listener: bool,
	) where
		I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let proxy = HTTPProxy {
			inputs: pi.clone(),
			tls_listener,
		};
		let connection = Arc::new(info);
		let mut server = auto::Builder::new(TokioExecutor::new());
		server
			.http1()
			.timer(TokioTimer::new())
			.header_read_timeout(pi.cfg.read_header_timeout);
		server.http2().timer(TokioTimer::new());
		let serve = server.serve_connection_with_upgrades(
			TokioIo::new(io),
			hyper::service::service_fn(move |req| {
				let proxy = proxy.clone();
				let connection = connection.clone();
				async move { proxy.proxy(connection, req).map(Ok::<_, Infallible>).await }
			}),
		);
		// GOAWAY / Connection: close on drain, while the connection finishes.
		let serve = drain.wrap_connection(serve);
		if let Err(e) = serve.await {
			debug!("connection ended: {e}");
		}
	}

	/// Keeps one TCP listener per registered router-group port, driven by the
	/// registry change stream.
	async fn reconcile_tcp_routes(pi: Arc<ProxyInputs>, drain: DrainWatcher) {
		let mut events = Box::pin(pi.registry.subscribe());
		let mut active: HashMap<TcpRouteKey, AbortHandle> = HashMap::new();
		let mut js: JoinSet<()> = JoinSet::new();
		let wait = drain.clone().wait_for_drain();
		tokio::pin!(wait);
		loop {
			tokio::select! {
				Some(ev) = events.next() => {
					let RouteAddress::Tcp(key) = ev.key else { continue };
					match ev.action {
						EventAction::Upsert => {
							if active.contains_key(&key) {
								continue;
							}
							if !Self::port_allowed(&pi, &key) {
								warn!(key = %key, "tcp route outside router group port range, ignoring");
								continue;
							}
							match TcpListener::bind(("0.0.0.0", key.external_port)).await {
								Ok(listener) => {
									info!(key = %key, "tcp route listener started");
									let handle = js.spawn(Self::run_tcp_listener(
										pi.clone(),
										drain.clone(),
										listener,
										key.clone(),
									));
									active.insert(key, handle);
								},
								Err(e) => warn!(key = %key, "tcp route bind failed: {e}"),
							}
						},
						EventAction::Remove => {
							if pi.registry.lookup_tcp(&key).is_none()
								&& let Some(handle) = active.remove(&key)
							{
								info!(key = %key, "tcp route listener stopped, no endpoints remain");
								handle.abort();
							}
						},
					}
				}
				_ = &mut wait => {
					js.abort_all();
					return;
				}
			}
		}
	}

	fn port_allowed(pi: &ProxyInputs, key: &TcpRouteKey) -> bool {
		let groups = pi.registry.router_groups();
		if groups.is_empty() {
			return true;
		}
		groups
			.iter()
			.any(|g| g.guid == key.router_group && g.contains_port(key.external_port))
	}

	async fn run_tcp_listener(
		pi: Arc<ProxyInputs>,
		drain: DrainWatcher,
		listener: TcpListener,
		key: TcpRouteKey,
	) {
		let proxy = Arc::new(TCPProxy::new(pi, key));
		let wait = drain.wait_for_drain();
		tokio::pin!(wait);
		loop {
			tokio::select! {
				accepted = listener.accept() => {
					let Ok((stream, peer)) = accepted else { continue };
					let proxy = proxy.clone();
					tokio::spawn(async move { proxy.proxy(stream, peer).await });
				}
				_ = &mut wait => {
					return;
				}
			}
		}
	}
}

fn pem_encode(der: &[u8]) -> String {
	use base64::Engine;
	let b64 = base64::engine::general_purpose::STANDARD.encode(der);
	let mut out = String::with_capacity(b64.len() + 64);
	out.push_str("-----BEGIN CERTIFICATE-----\n");
	for chunk in b64.as_bytes().chunks(64) {
		out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
		out.push('\n');
	}
	out.push_str("-----END CERTIFICATE-----\n");
	out
}
