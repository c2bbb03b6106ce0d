use http_body_util::BodyExt;
use hyper::body::Incoming;
use router_core::prelude::*;

use crate::ProxyInputs;
use crate::accesslog::RequestLog;
use crate::client::{DialError, DialTarget, DialTimings};
use crate::http::{Body, HeaderValue, Method, Request, Scheme, Uri, header};
use crate::proxy::ProxyError;
use crate::registry::PoolSnapshot;
use crate::types::Endpoint;

/// Bodies up to this size are buffered so a failed attempt can be replayed.
const MAX_REPLAY_BYTES: u64 = 64 * 1024;

pub struct RoundTripOutcome {
	pub response: ::http::Response<Incoming>,
	pub endpoint: Arc<Endpoint>,
	/// Keeps the endpoint's active-request gauge up while the response
	/// streams; attach to the response.
	pub active: ActiveGuard,
}

#[derive(Clone)]
pub struct ActiveGuard(#[allow(dead_code)] Arc<crate::types::ActiveRequest>);

enum ReplayBody {
	Empty,
	Buffered(Bytes),
	/// Not replayable; usable for exactly one attempt.
	Stream(Option<Body>),
}

impl ReplayBody {
	async fn prepare(body: Body, attempts: usize) -> Result<ReplayBody, ProxyError> {
		let hint = http_body::Body::size_hint(&body);
		if hint.exact() == Some(0) {
			return Ok(ReplayBody::Empty);
		}
		if attempts > 1 && hint.upper().map(|u| u <= MAX_REPLAY_BYTES).unwrap_or(false) {
			let collected = body
				.collect()
				.await
				.map_err(|e| ProxyError::BadRequest(format!("failed reading request body: {e}")))?;
			return Ok(ReplayBody::Buffered(collected.to_bytes()));
		}
		Ok(ReplayBody::Stream(Some(body)))
	}

	/// The body for the next attempt, when one can still be produced.
	fn take(&mut self) -> Option<Body> {
		match self {
			ReplayBody::Empty => Some(Body::empty()),
			ReplayBody::Buffered(b) => Some(Body::from(b.clone())),
			ReplayBody::Stream(b) => b.take(),
		}
	}

	fn replayable(&self) -> bool {
		matches!(self, ReplayBody::Empty | ReplayBody::Buffered(_))
	}

	fn is_empty_body(&self) -> bool {
		matches!(self, ReplayBody::Empty)
	}
}

fn is_idempotent(method: &Method) -> bool {
	matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn map_dial_error(e: DialError) -> ProxyError {
	match e {
		DialError::Tls(msg) => ProxyError::BackendTls(msg),
		DialError::TlsTimeout => ProxyError::BackendTls("handshake timed out".to_string()),
		other => ProxyError::BackendUnreachable(other.to_string()),
	}
}

fn record_timings(log: &mut RequestLog, t: &DialTimings) {
	if !t.reused {
		log.attempts.dns_time = t.dns;
		log.attempts.dial_time = t.dial;
		log.attempts.tls_time = t.tls;
	}
}

/// Builds the per-attempt request in the form the backend connection expects:
/// origin-form plus Host for HTTP/1.1, absolute-form for HTTP/2. The original
/// Host is forwarded either way.
fn attempt_request(
	head: &::http::request::Parts,
	body: Body,
	target: &DialTarget,
	host: &str,
	attempt: usize,
) -> Result<Request, ProxyError> {
	let mut parts = head.clone();
	let scheme = if target.tls { Scheme::HTTPS } else { Scheme::HTTP };
	if target.http2 {
		parts.version = ::http::Version::HTTP_2;
		parts.headers.remove(header::TRANSFER_ENCODING);
		parts.headers.remove(header::HOST);
		let mut uri = parts.uri.into_parts();
		uri.scheme = Some(scheme);
		parts.uri =
			Uri::from_parts(uri).map_err(|e| ProxyError::Internal(format!("uri rebuild: {e}")))?;
	} else {
		parts.version = ::http::Version::HTTP_11;
		let path_and_query = parts
			.uri
			.path_and_query()
			.cloned()
			.unwrap_or_else(|| "/".parse().expect("static path parses"));
		parts.uri = Uri::from(path_and_query);
		parts.headers.insert(
			header::HOST,
			HeaderValue::try_from(host)
				.map_err(|e| ProxyError::BadRequest(format!("bad host: {e}")))?,
		);
	}
	if attempt > 0
		&& let Ok(v) = HeaderValue::try_from(attempt.to_string())
	{
		parts.headers.insert("x-retry-attempt", v);
	}
	Ok(Request::from_parts(parts, body))
}

/// The endpoint-iteration retry loop: choose, dial-or-reuse, send, classify.
/// At most `min(pool size, configured ceiling)` attempts; a failure is only
/// retried when it happened before a response byte and the request body can
/// actually be re-sent.
pub async fn round_trip(
	inputs: &ProxyInputs,
	pool: &PoolSnapshot,
	sticky: Option<&str>,
	req: Request,
	log: &mut RequestLog,
) -> Result<RoundTripOutcome, ProxyError> {
	let cfg = inputs.backends.config().clone();
	let budget = pool.attempt_budget();
	let (head, body) = req.into_parts();
	let host = head
		.uri
		.host()
		.map(str::to_string)
		.unwrap_or_default();
	let is_upgrade = head.headers.contains_key(header::UPGRADE);
	let dial_override = is_upgrade.then_some(cfg.websocket_dial_timeout);
	let mut replay = ReplayBody::prepare(body, budget).await?;
	let idempotent = is_idempotent(&head.method);

	let mut last_err: Option<ProxyError> = None;
	for attempt in 0..budget {
		let sticky_hint = (attempt == 0).then_some(sticky).flatten();
		let Some(endpoint) = pool.next(sticky_hint) else {
			return Err(last_err.unwrap_or(ProxyError::NoEndpoints));
		};
		inputs.metrics.backend_attempts.inc();
		if attempt > 0 {
			inputs.metrics.backend_retries.inc();
		}
		log.backend_addr = Some(endpoint.hostport());
		log.app_id = Some(endpoint.app_id.to_string());
		log.app_index = Some(endpoint.instance_index.to_string());
		log.instance_id = Some(endpoint.id.instance_id.to_string());

		let attempt_start = Instant::now();
		let target = DialTarget::from(endpoint.as_ref());
		let (mut conn, timings) = match inputs.backends.checkout(&target, dial_override).await {
			Ok(ok) => ok,
			Err(e) => {
				// Nothing was sent; always retryable within budget.
				pool.mark_failed(&endpoint);
				log.attempts.failed_attempts += 1;
				log.attempts.failed_attempts_time += attempt_start.elapsed();
				let err = map_dial_error(e);
				debug!(endpoint = %endpoint.hostport(), attempt, "dial failed: {err}");
				if attempt + 1 >= budget {
					inputs.metrics.backend_exhausted.inc();
					return Err(err);
				}
				last_err = Some(err);
				continue;
			},
		};
		record_timings(log, &timings);

		let Some(attempt_body) = replay.take() else {
			// The streaming body is gone; no further attempt is possible.
			inputs.metrics.backend_exhausted.inc();
			return Err(last_err.unwrap_or(ProxyError::NoEndpoints));
		};
		let attempt_req = attempt_request(&head, attempt_body, &target, &host, attempt)?;
		let active = endpoint.begin_request();

		let send_start = Instant::now();
		let result = tokio::time::timeout(cfg.response_timeout, conn.send(attempt_req)).await;
		match result {
			Ok(Ok(response)) => {
				log.attempts.backend_time = Some(send_start.elapsed());
				endpoint.record_success();
				let upgraded = response.status() == http::StatusCode::SWITCHING_PROTOCOLS;
				if !upgraded && !conn.is_http2() {
					inputs.backends.checkin(conn);
				}
				return Ok(RoundTripOutcome {
					response,
					endpoint,
					active: ActiveGuard(Arc::new(active)),
				});
			},
			Ok(Err(e)) => {
				drop(active);
				pool.mark_failed(&endpoint);
				log.attempts.failed_attempts += 1;
				log.attempts.failed_attempts_time += attempt_start.elapsed();
				let err = ProxyError::BackendUnreachable(format!("connection failed: {e}"));
				debug!(endpoint = %endpoint.hostport(), attempt, "send failed: {err}");
				// The request reached the wire. Re-sending is safe only when the
				// body can be replayed, and a consumed non-empty body additionally
				// requires an idempotent method.
				let retryable = replay.replayable() && (idempotent || replay.is_empty_body());
				if !retryable || attempt + 1 >= budget {
					inputs.metrics.backend_exhausted.inc();
					return Err(err);
				}
				last_err = Some(err);
			},
			Err(_) => {
				drop(active);
				pool.mark_failed(&endpoint);
				inputs.metrics.backend_exhausted.inc();
				return Err(ProxyError::BackendTimeout);
			},
		}
	}
	Err(last_err.unwrap_or(ProxyError::NoEndpoints))
}

/// One-shot round trip to an absolute URL; used for the route-service detour
/// leg, which targets the detour URL rather than a pool endpoint.
pub async fn call_url(
	inputs: &ProxyInputs,
	url: &Uri,
	req: Request,
) -> Result<::http::Response<Incoming>, ProxyError> {
	let cfg = inputs.backends.config();
	let host = url
		.host()
		.ok_or_else(|| ProxyError::BadRequest("route service url has no host".to_string()))?;
	let tls = url.scheme() == Some(&Scheme::HTTPS);
	let port = url
		.port_u16()
		.unwrap_or(if tls { 443 } else { 80 });
	let target = DialTarget {
		host: strng::new(host),
		port,
		tls,
		server_name: None,
		http2: false,
	};
	let (mut conn, _) = inputs
		.backends
		.checkout(&target, None)
		.await
		.map_err(map_dial_error)?;

	let (mut head, body) = req.into_parts();
	let path_and_query = url
		.path_and_query()
		.cloned()
		.unwrap_or_else(|| "/".parse().expect("static path parses"));
	head.uri = Uri::from(path_and_query);
	head.headers.insert(
		header::HOST,
		HeaderValue::try_from(host).map_err(|e| ProxyError::BadRequest(format!("bad host: {e}")))?,
	);
	head.version = ::http::Version::HTTP_11;
	let req = Request::from_parts(head, body);

	let response = tokio::time::timeout(cfg.response_timeout, conn.send(req))
		.await
		.map_err(|_| ProxyError::BackendTimeout)?
		.map_err(|e| ProxyError::BackendUnreachable(format!("route service call failed: {e}")))?;
	if !conn.is_http2() {
		inputs.backends.checkin(conn);
	}
	Ok(response)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn empty_body_always_replayable() {
		let replay = ReplayBody::prepare(Body::empty(), 3).await.unwrap();
		assert!(replay.replayable());
		assert!(replay.is_empty_body());
	}

	#[tokio::test]
	async fn small_body_buffered_for_retry() {
		let mut replay = ReplayBody::prepare(Body::from("hello"), 3).await.unwrap();
		assert!(replay.replayable());
		let first = replay.take().unwrap();
		let second = replay.take().unwrap();
		let a = first.collect().await.unwrap().to_bytes();
		let b = second.collect().await.unwrap().to_bytes();
		assert_eq!(a, b);
		assert_eq!(a.as_ref(), b"hello");
	}

	#[tokio::test]
	async fn single_attempt_bodies_stream_through() {
		let mut replay = ReplayBody::prepare(Body::from("hello"), 1).await.unwrap();
		assert!(!replay.replayable());
		assert!(replay.take().is_some());
		assert!(replay.take().is_none());
	}

	#[test]
	fn idempotent_methods() {
		assert!(is_idempotent(&Method::GET));
		assert!(is_idempotent(&Method::HEAD));
		assert!(is_idempotent(&Method::OPTIONS));
		assert!(!is_idempotent(&Method::POST));
		assert!(!is_idempotent(&Method::PUT));
	}

	#[test]
	fn attempt_request_origin_form_for_h1() {
		let req = ::http::Request::builder()
			.method(Method::GET)
			.uri("http://foo.example.com/api/v1?x=1")
			.body(Body::empty())
			.unwrap();
		let (head, _) = req.into_parts();
		let target = DialTarget {
			host: strng::new("10.0.0.1"),
			port: 8080,
			tls: false,
			server_name: None,
			http2: false,
		};
		let out = attempt_request(&head, Body::empty(), &target, "foo.example.com", 1).unwrap();
		assert_eq!(out.uri().to_string(), "/api/v1?x=1");
		assert_eq!(out.headers().get(header::HOST).unwrap(), "foo.example.com");
		assert_eq!(out.headers().get("x-retry-attempt").unwrap(), "1");
	}

	#[test]
	fn attempt_request_absolute_form_for_h2() {
		let req = ::http::Request::builder()
			.method(Method::GET)
			.uri("http://foo.example.com/api")
			.header(header::TRANSFER_ENCODING, "chunked")
			.body(Body::empty())
			.unwrap();
		let (head, _) = req.into_parts();
		let target = DialTarget {
			host: strng::new("10.0.0.1"),
			port: 8080,
			tls: true,
			server_name: None,
			http2: true,
		};
		let out = attempt_request(&head, Body::empty(), &target, "foo.example.com", 0).unwrap();
		assert_eq!(out.version(), ::http::Version::HTTP_2);
		assert_eq!(out.uri().scheme(), Some(&Scheme::HTTPS));
		assert_eq!(out.uri().host(), Some("foo.example.com"));
		assert!(out.headers().get(header::TRANSFER_ENCODING).is_none());
		assert!(out.headers().get("x-retry-attempt").is_none());
	}
}
