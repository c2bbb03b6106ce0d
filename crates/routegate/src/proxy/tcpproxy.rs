use router_core::prelude::*;
use tokio::net::TcpStream;

use crate::ProxyInputs;
use crate::accesslog::{DropOnLog, RequestLog};
use crate::types::TcpRouteKey;

/// Data path for TCP routes: choose an endpoint, dial, splice until either
/// side closes. One access-log record per connection, with no HTTP fields.
pub struct TCPProxy {
	pub(super) inputs: Arc<ProxyInputs>,
	pub(super) key: TcpRouteKey,
}

impl TCPProxy {
	pub fn new(inputs: Arc<ProxyInputs>, key: TcpRouteKey) -> TCPProxy {
		TCPProxy { inputs, key }
	}

	pub async fn proxy(&self, mut downstream: TcpStream, peer: SocketAddr) {
		let mut log: DropOnLog = RequestLog::new(
			self.inputs.access_log.clone(),
			Arc::new(self.inputs.cfg.access_log.clone()),
		)
		.into();
		log.with(|l| {
			l.host = Some(self.key.to_string());
			l.remote_addr = Some(peer.to_string());
		});

		let Some(pool) = self.inputs.registry.lookup_tcp(&self.key) else {
			debug!(key = %self.key, "no tcp route");
			return;
		};
		let Some(endpoint) = pool.next(None) else {
			debug!(key = %self.key, "tcp route has no endpoints");
			return;
		};
		log.with(|l| {
			l.backend_addr = Some(endpoint.hostport());
			l.app_id = Some(endpoint.app_id.to_string());
			l.instance_id = Some(endpoint.id.instance_id.to_string());
		});

		let upstream = match self
			.inputs
			.backends
			.dial_tcp(&endpoint.id.host, endpoint.id.port)
			.await
		{
			Ok(s) => s,
			Err(e) => {
				pool.mark_failed(&endpoint);
				warn!(key = %self.key, endpoint = %endpoint.hostport(), "tcp dial failed: {e}");
				return;
			},
		};
		endpoint.record_success();
		let _active = endpoint.begin_request();

		let mut upstream = upstream;
		match router_core::copy::copy_bidirectional(&mut downstream, &mut upstream).await {
			Ok(res) => {
				log.with(|l| {
					l.body_bytes
						.store(res.received, std::sync::atomic::Ordering::Relaxed);
					l.request_bytes = Some(res.sent);
				});
			},
			Err(e) => debug!(key = %self.key, "tcp splice ended with error: {e}"),
		}
	}
}
