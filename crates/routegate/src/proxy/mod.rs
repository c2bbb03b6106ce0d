pub mod gateway;
pub mod httpproxy;
pub mod roundtrip;
pub mod tcpproxy;

pub use gateway::Gateway;
use http::StatusCode;

use crate::http::{Body, HeaderValue, Response, x_headers};

/// Backend origin-TLS failure; not in the registered status table.
fn status_backend_tls() -> StatusCode {
	StatusCode::from_u16(526).expect("526 is a valid status code")
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("empty host header")]
	EmptyHost,
	#[error("bad request: {0}")]
	BadRequest(String),
	#[error("no route registered for host")]
	RouteNotFound,
	#[error("route has no endpoints")]
	NoEndpoints,
	#[error("backend unreachable: {0}")]
	BackendUnreachable(String),
	#[error("backend response timeout")]
	BackendTimeout,
	#[error("backend TLS handshake failed: {0}")]
	BackendTls(String),
	#[error("draining, not accepting requests")]
	DrainInProgress,
	#[error("route service signature expired")]
	RouteServiceExpired,
	#[error("request upgrade failed, backend offered {0:?}")]
	UpgradeFailed(Option<HeaderValue>),
	#[error("internal error: {0}")]
	Internal(String),
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::EmptyHost | ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
			ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
			ProxyError::NoEndpoints
			| ProxyError::BackendUnreachable(_)
			| ProxyError::RouteServiceExpired
			| ProxyError::UpgradeFailed(_) => StatusCode::BAD_GATEWAY,
			ProxyError::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::BackendTls(_) => status_backend_tls(),
			ProxyError::DrainInProgress => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// The taxonomy code surfaced in X-Cf-RouterError and the access log.
	pub fn taxonomy(&self) -> &'static str {
		match self {
			ProxyError::EmptyHost => "empty-host",
			ProxyError::BadRequest(_) => "bad-request",
			ProxyError::RouteNotFound => "unknown-route",
			ProxyError::NoEndpoints => "no-endpoints",
			ProxyError::BackendUnreachable(_) => "backend-unreachable",
			ProxyError::BackendTimeout => "backend-timeout",
			ProxyError::BackendTls(_) => "backend-tls",
			ProxyError::DrainInProgress => "drain-in-progress",
			ProxyError::RouteServiceExpired => "route-service-expired",
			ProxyError::UpgradeFailed(_) => "backend-unreachable",
			ProxyError::Internal(_) => "internal",
		}
	}

	/// Synthesizes the client-facing response for this error.
	pub fn as_response(&self) -> Response {
		let taxonomy = self.taxonomy();
		::http::Response::builder()
			.status(self.status())
			.header(http::header::CONTENT_TYPE, "text/plain")
			.header(x_headers::X_CF_ROUTER_ERROR, taxonomy)
			.body(Body::from(format!("{taxonomy}\n")))
			.expect("static response builds")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn taxonomy_maps_to_status() {
		let cases = [
			(ProxyError::EmptyHost, 400, "empty-host"),
			(ProxyError::RouteNotFound, 404, "unknown-route"),
			(ProxyError::NoEndpoints, 502, "no-endpoints"),
			(
				ProxyError::BackendUnreachable("refused".into()),
				502,
				"backend-unreachable",
			),
			(ProxyError::BackendTimeout, 504, "backend-timeout"),
			(ProxyError::BackendTls("bad cert".into()), 526, "backend-tls"),
			(ProxyError::DrainInProgress, 503, "drain-in-progress"),
			(ProxyError::RouteServiceExpired, 502, "route-service-expired"),
		];
		for (err, status, taxonomy) in cases {
			assert_eq!(err.status().as_u16(), status, "{err}");
			assert_eq!(err.taxonomy(), taxonomy, "{err}");
			let resp = err.as_response();
			assert_eq!(resp.status().as_u16(), status);
			assert_eq!(
				resp.headers().get(&x_headers::X_CF_ROUTER_ERROR).unwrap(),
				taxonomy
			);
		}
	}
}
