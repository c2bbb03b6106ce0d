use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use headers::HeaderMapExt;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use router_core::prelude::*;

use crate::accesslog::{DropOnLog, LogBody, RequestLog};
use crate::http::{
	Body, HeaderValue, Method, Request, RequestUpgrade, Response, Uri, header, x_headers,
};
use crate::proxy::{ProxyError, roundtrip};
use crate::routeservice;
use crate::types::Endpoint;
use crate::{ConnectionInfo, ForwardedClientCert, ProxyInputs};

const STICKY_COOKIE: &str = "__VCAP_ID__";

#[derive(Clone)]
pub struct HTTPProxy {
	pub(super) inputs: Arc<ProxyInputs>,
	/// Whether this listener terminates TLS; drives X-Forwarded-Proto.
	pub(super) tls_listener: bool,
}

/// Request-scoped context threaded between stages.
struct RequestCtx {
	/// This request is the return leg of a route-service detour.
	detour_arrival: bool,
	sticky: Option<String>,
	upgrade: Option<RequestUpgrade>,
}

impl HTTPProxy {
	pub async fn proxy(
		&self,
		connection: Arc<ConnectionInfo>,
		req: ::http::Request<Incoming>,
	) -> Response {
		let mut log: DropOnLog = RequestLog::new(
			self.inputs.access_log.clone(),
			Arc::new(self.inputs.cfg.access_log.clone()),
		)
		.into();
		log.with(|l| l.remote_addr = Some(connection.peer_addr.to_string()));

		let result = AssertUnwindSafe(self.proxy_internal(connection, req, &mut log))
			.catch_unwind()
			.await
			.unwrap_or_else(|panic| {
				let msg = panic
					.downcast_ref::<&str>()
					.map(|s| s.to_string())
					.or_else(|| panic.downcast_ref::<String>().cloned())
					.unwrap_or_else(|| "panic".to_string());
				error!("request task panicked: {msg}");
				Err(ProxyError::Internal(msg))
			});

		let response = match result {
			Ok(resp) => resp,
			Err(err) => {
				log.with(|l| l.router_error = Some(err.taxonomy()));
				err.as_response()
			},
		};
		log.with(|l| l.status = Some(response.status()));
		response.map(move |b| Body::new(LogBody::new(b, log)))
	}

	async fn proxy_internal(
		&self,
		connection: Arc<ConnectionInfo>,
		req: ::http::Request<Incoming>,
		log: &mut DropOnLog,
	) -> Result<Response, ProxyError> {
		let inputs = &self.inputs;
		let cfg = &inputs.cfg;
		let mut req = req.map(Body::new);

		// Protocol normalisation: a request we cannot attribute to a host is
		// refused before any other work.
		if *inputs.draining.borrow() {
			return Err(ProxyError::DrainInProgress);
		}
		crate::http::normalize_uri(&mut req, self.tls_listener)?;
		if req.method() == Method::CONNECT {
			return Err(ProxyError::BadRequest("CONNECT is not supported".to_string()));
		}
		let host = crate::http::get_host(&req)?.to_string();

		log.with(|l| {
			l.host = Some(host.clone());
			l.method = Some(req.method().clone());
			l.uri = Some(
				req
					.uri()
					.path_and_query()
					.map(|pq| pq.to_string())
					.unwrap_or_else(|| req.uri().path().to_string()),
			);
			l.protocol = Some(version_str(req.version()).to_string());
			l.request_bytes = req
				.headers()
				.get(header::CONTENT_LENGTH)
				.and_then(|v| v.to_str().ok())
				.and_then(|v| v.parse().ok());
			l.referer = header_string(&req, header::REFERER);
			l.user_agent = header_string(&req, header::USER_AGENT);
			for name in &cfg.access_log.extra_headers {
				let value = req
					.headers()
					.get(name.as_str())
					.and_then(|v| v.to_str().ok())
					.map(str::to_string);
				l.extra_headers.push((name.to_string(), value));
			}
		});

		// Health probe short-circuit: no lookup, no access log.
		if req.method() == Method::GET
			&& req
				.headers()
				.get(header::USER_AGENT)
				.map(|ua| ua.as_bytes() == cfg.health_check_user_agent.as_bytes())
				.unwrap_or(false)
		{
			log.with(|l| l.suppress = true);
			return Ok(
				::http::Response::builder()
					.status(http::StatusCode::OK)
					.body(Body::empty())
					.expect("static response builds"),
			);
		}

		let mut ctx = RequestCtx {
			detour_arrival: false,
			sticky: None,
			upgrade: None,
		};

		// Route-service arrival detection: a valid signed envelope means this
		// is the return leg, handled as if it originated at the original URL.
		let (host, mut req) = self.detect_detour_arrival(host, req, &mut ctx)?;

		let path = req.uri().path().to_string();
		let Some(pool) = inputs.registry.lookup(&host, &path) else {
			return Err(ProxyError::RouteNotFound);
		};

		self.sanitize_headers(&connection, &mut req, &mut ctx, log)?;

		// Outbound route-service detour: forward to the interceptor instead of
		// an endpoint. The detour leg itself is not access-logged; the return
		// leg will be.
		if let Some(rs_url) = pool.route_service_url.clone()
			&& !ctx.detour_arrival
		{
			log.with(|l| l.suppress = true);
			return self.detour(&host, rs_url, req).await;
		}

		let outcome = roundtrip::round_trip(inputs, &pool, ctx.sticky.as_deref(), req, log.as_mut().expect("log is held")).await?;

		if outcome.response.status() == http::StatusCode::SWITCHING_PROTOCOLS {
			return handle_upgrade(&mut ctx.upgrade, outcome);
		}

		let mut response = outcome.response.map(Body::new);
		response.extensions_mut().insert(outcome.active);
		crate::http::strip_hop_headers(response.headers_mut());
		rewrite_sticky_cookie(&ctx, &outcome.endpoint, &mut response);
		Ok(response)
	}

	/// Inspects and strips the signed detour envelope. Returns the effective
	/// host (the original URL's on the return leg) and request.
	fn detect_detour_arrival(
		&self,
		host: String,
		mut req: Request,
		ctx: &mut RequestCtx,
	) -> Result<(String, Request), ProxyError> {
		let Some(keyring) = &self.inputs.route_services else {
			return Ok((host, req));
		};
		let (Some(signature), Some(metadata)) = (
			req.headers().get(&routeservice::SIGNATURE).cloned(),
			req.headers().get(&routeservice::METADATA).cloned(),
		) else {
			return Ok((host, req));
		};
		let signature = signature
			.to_str()
			.map_err(|_| ProxyError::BadRequest("bad route service signature".to_string()))?
			.to_string();
		let metadata = metadata
			.to_str()
			.map_err(|_| ProxyError::BadRequest("bad route service metadata".to_string()))?
			.to_string();
		let forwarded = keyring
			.verify(&signature, &metadata, std::time::SystemTime::now())
			.map_err(|e| match e {
				routeservice::SignatureError::Expired => ProxyError::RouteServiceExpired,
				routeservice::SignatureError::Invalid => {
					ProxyError::BadRequest("route service signature invalid".to_string())
				},
			})?;

		let uri: Uri = forwarded
			.forwarded_url
			.parse()
			.map_err(|_| ProxyError::BadRequest("bad forwarded url".to_string()))?;
		let host = uri
			.host()
			.ok_or_else(|| ProxyError::BadRequest("forwarded url has no host".to_string()))?
			.to_string();
		for h in [
			&routeservice::SIGNATURE,
			&routeservice::METADATA,
			&routeservice::FORWARDED_URL,
		] {
			req.headers_mut().remove(h);
		}
		*req.uri_mut() = uri;
		ctx.detour_arrival = true;
		Ok((host, req))
	}

	/// XFF/XFP/request-id/client-cert policy, hop-by-hop stripping, and sticky
	/// cookie extraction.
	fn sanitize_headers(
		&self,
		connection: &ConnectionInfo,
		req: &mut Request,
		ctx: &mut RequestCtx,
		log: &mut DropOnLog,
	) -> Result<(), ProxyError> {
		let cfg = &self.inputs.cfg;
		let headers_snapshot_proto = req
			.headers()
			.get(&x_headers::X_FORWARDED_PROTO)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);

		if cfg.xff_append {
			crate::http::append_xff(req.headers_mut(), connection.peer_addr.ip());
		}

		// X-Forwarded-Proto reflects this listener unless the value arrived
		// through the trusted detour return leg.
		let scheme = if self.tls_listener { "https" } else { "http" };
		let xfp = match (&headers_snapshot_proto, ctx.detour_arrival) {
			(Some(existing), true) => existing.clone(),
			_ => scheme.to_string(),
		};
		req.headers_mut().insert(
			x_headers::X_FORWARDED_PROTO,
			HeaderValue::try_from(xfp.clone())
				.map_err(|e| ProxyError::BadRequest(format!("bad forwarded proto: {e}")))?,
		);

		if !req.headers().contains_key(&x_headers::X_VCAP_REQUEST_ID) {
			let id = uuid::Uuid::new_v4().to_string();
			req.headers_mut().insert(
				x_headers::X_VCAP_REQUEST_ID,
				HeaderValue::try_from(id).expect("uuid is a valid header value"),
			);
		}

		let client_cert = connection.tls.as_ref().and_then(|t| t.client_cert_pem.clone());
		match cfg.forwarded_client_cert {
			ForwardedClientCert::AlwaysForward => {},
			ForwardedClientCert::Forward => {
				if client_cert.is_none() {
					req.headers_mut().remove(&x_headers::X_FORWARDED_CLIENT_CERT);
				}
			},
			ForwardedClientCert::SanitizeSet => {
				req.headers_mut().remove(&x_headers::X_FORWARDED_CLIENT_CERT);
				if let Some(pem) = client_cert
					&& let Ok(v) = HeaderValue::try_from(pem.replace(['\n', '\r'], ""))
				{
					req.headers_mut().insert(x_headers::X_FORWARDED_CLIENT_CERT, v);
				}
			},
		}

		ctx.sticky = req
			.headers()
			.typed_get::<headers::Cookie>()
			.and_then(|c| c.get(STICKY_COOKIE).map(str::to_string));

		ctx.upgrade = crate::http::hop_by_hop_headers(req);

		log.with(|l| {
			l.x_forwarded_for = req
				.headers()
				.get(&x_headers::X_FORWARDED_FOR)
				.and_then(|v| v.to_str().ok())
				.map(str::to_string);
			l.x_forwarded_proto = Some(xfp);
			l.vcap_request_id = req
				.headers()
				.get(&x_headers::X_VCAP_REQUEST_ID)
				.and_then(|v| v.to_str().ok())
				.map(str::to_string);
		});
		Ok(())
	}

	/// Signs the envelope and forwards to the route-service URL.
	async fn detour(&self, host: &str, rs_url: Strng, req: Request) -> Result<Response, ProxyError> {
		let Some(keyring) = &self.inputs.route_services else {
			return Err(ProxyError::Internal(
				"route service configured but no signing keys are loaded".to_string(),
			));
		};
		let url: Uri = rs_url
			.parse()
			.map_err(|_| ProxyError::Internal(format!("bad route service url {rs_url}")))?;

		let scheme = if self.tls_listener { "https" } else { "http" };
		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.to_string())
			.unwrap_or_else(|| "/".to_string());
		let original_url = format!("{scheme}://{host}{path_and_query}");
		let (signature, metadata) = keyring
			.sign(&original_url, std::time::SystemTime::now())
			.map_err(|e| ProxyError::Internal(format!("envelope signing failed: {e}")))?;

		let mut req = req;
		let headers = req.headers_mut();
		headers.insert(
			routeservice::FORWARDED_URL,
			HeaderValue::try_from(original_url)
				.map_err(|e| ProxyError::BadRequest(format!("bad forwarded url: {e}")))?,
		);
		headers.insert(
			routeservice::SIGNATURE,
			HeaderValue::try_from(signature).expect("base64 is a valid header value"),
		);
		headers.insert(
			routeservice::METADATA,
			HeaderValue::try_from(metadata).expect("base64 is a valid header value"),
		);

		let response = roundtrip::call_url(&self.inputs, &url, req).await?;
		let mut response = response.map(Body::new);
		crate::http::strip_hop_headers(response.headers_mut());
		Ok(response)
	}
}

fn version_str(v: ::http::Version) -> &'static str {
	match v {
		::http::Version::HTTP_10 => "HTTP/1.0",
		::http::Version::HTTP_11 => "HTTP/1.1",
		::http::Version::HTTP_2 => "HTTP/2.0",
		_ => "HTTP/1.1",
	}
}

fn header_string(req: &Request, name: http::HeaderName) -> Option<String> {
	req
		.headers()
		.get(name)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string)
}

/// On a sticky miss, tell the client which instance now serves it.
fn rewrite_sticky_cookie(ctx: &RequestCtx, endpoint: &Endpoint, response: &mut Response) {
	let Some(requested) = &ctx.sticky else { return };
	let chosen = endpoint.id.instance_id.as_str();
	if chosen.is_empty() || requested == chosen {
		return;
	}
	if let Ok(v) = HeaderValue::try_from(format!("{STICKY_COOKIE}={chosen}; Path=/; HttpOnly")) {
		response.headers_mut().append(header::SET_COOKIE, v);
	}
}

/// Splices the two upgraded connections once both sides have switched.
fn handle_upgrade(
	req_upgrade: &mut Option<RequestUpgrade>,
	outcome: roundtrip::RoundTripOutcome,
) -> Result<Response, ProxyError> {
	let mut response = outcome.response;
	let Some(RequestUpgrade {
		upgrade_type,
		on_upgrade,
	}) = std::mem::take(req_upgrade)
	else {
		return Err(ProxyError::UpgradeFailed(None));
	};
	let offered = crate::http::upgrade_type(response.headers());
	if offered.as_ref() != Some(&upgrade_type) {
		return Err(ProxyError::UpgradeFailed(offered));
	}
	let backend_upgrade = response
		.extensions_mut()
		.remove::<OnUpgrade>()
		.ok_or_else(|| ProxyError::UpgradeFailed(None))?;
	let active = outcome.active;
	tokio::spawn(async move {
		let _active = active;
		let (client, backend) = match tokio::join!(on_upgrade, backend_upgrade) {
			(Ok(c), Ok(b)) => (c, b),
			(c, b) => {
				warn!(
					"upgrade completion failed: client={:?} backend={:?}",
					c.err(),
					b.err()
				);
				return;
			},
		};
		// Deadlines are off on hijacked sockets; the tunnel lives until either
		// side closes.
		let mut client = TokioIo::new(client);
		let mut backend = TokioIo::new(backend);
		if let Err(e) = router_core::copy::copy_bidirectional(&mut client, &mut backend).await {
			debug!("spliced connection ended with error: {e}");
		}
	});
	Ok(response.map(Body::new))
}
