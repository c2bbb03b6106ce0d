use std::net::IpAddr;

pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};
use headers::HeaderMapExt;
use hyper::upgrade::OnUpgrade;

use crate::proxy::ProxyError;

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub mod x_headers {
	use http::HeaderName;

	pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
	pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
	pub const X_FORWARDED_CLIENT_CERT: HeaderName = HeaderName::from_static("x-forwarded-client-cert");
	pub const X_VCAP_REQUEST_ID: HeaderName = HeaderName::from_static("x-vcap-request-id");
	pub const X_CF_ROUTER_ERROR: HeaderName = HeaderName::from_static("x-cf-routererror");
}

/// The http library will not put the authority into req.uri() for HTTP/1.
/// Normalize so the rest of the pipeline doesn't need to care. A request with
/// no resolvable host is rejected here.
pub fn normalize_uri(req: &mut Request, tls: bool) -> Result<(), ProxyError> {
	if let ::http::Version::HTTP_10 | ::http::Version::HTTP_11 = req.version()
		&& req.uri().authority().is_none()
	{
		let mut parts = std::mem::take(req.uri_mut()).into_parts();
		let host = req
			.headers()
			.get(header::HOST)
			.and_then(|h| h.to_str().ok())
			.filter(|h| !h.is_empty())
			.and_then(|h| h.parse::<Authority>().ok())
			.ok_or(ProxyError::EmptyHost)?;
		req.headers_mut().remove(header::HOST);
		parts.authority = Some(host);
		if parts.path_and_query.is_some() {
			parts.scheme = Some(if tls { Scheme::HTTPS } else { Scheme::HTTP });
		}
		*req.uri_mut() =
			Uri::from_parts(parts).map_err(|e| ProxyError::BadRequest(e.to_string()))?;
	}
	if req.uri().host().map(str::is_empty).unwrap_or(true) {
		return Err(ProxyError::EmptyHost);
	}
	Ok(())
}

pub fn get_host(req: &Request) -> Result<&str, ProxyError> {
	let host = req.uri().host().ok_or(ProxyError::EmptyHost)?;
	Ok(strip_port(host))
}

// Copied from the private `http` helper.
fn strip_port(auth: &str) -> &str {
	let host_port = auth
		.rsplit('@')
		.next()
		.expect("split always has at least 1 item");
	if host_port.as_bytes()[0] == b'[' {
		let i = host_port
			.find(']')
			.expect("parsing should validate brackets");
		&host_port[0..i + 1]
	} else {
		host_port
			.split(':')
			.next()
			.expect("split always has at least 1 item")
	}
}

// Hop-by-hop headers, removed before forwarding in either direction.
// As of RFC 7230 these are required to appear in the Connection header; the
// fixed list covers the RFC 2616 legacy set still sent in the wild.
static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

pub struct RequestUpgrade {
	pub upgrade_type: HeaderValue,
	pub on_upgrade: OnUpgrade,
}

/// Strips hop-by-hop request headers, re-adding the upgrade pair when the
/// client asked for one. Returns the client's upgrade handle so the pipeline
/// can splice after a 101 from the backend.
pub fn hop_by_hop_headers(req: &mut Request) -> Option<RequestUpgrade> {
	let trailers = req
		.headers()
		.get(header::TE)
		.and_then(|h| h.to_str().ok())
		.map(|s| s.contains("trailers"))
		.unwrap_or(false);
	let upgrade = upgrade_type(req.headers());
	for h in HOP_HEADERS.iter() {
		req.headers_mut().remove(h);
	}
	if trailers {
		req.headers_mut().typed_insert(headers::Te::trailers());
	}
	if let Some(upgrade) = upgrade.clone() {
		req.headers_mut().typed_insert(headers::Connection::upgrade());
		req.headers_mut().insert(header::UPGRADE, upgrade);
	}
	let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
	match (upgrade, on_upgrade) {
		(Some(upgrade_type), Some(on_upgrade)) => Some(RequestUpgrade {
			upgrade_type,
			on_upgrade,
		}),
		_ => None,
	}
}

pub fn strip_hop_headers(headers: &mut HeaderMap) {
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
}

/// The requested upgrade protocol, when `Connection: upgrade` names one.
pub fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
	let con = headers.typed_get::<headers::Connection>()?;
	if con.contains(header::UPGRADE) {
		headers.get(header::UPGRADE).cloned()
	} else {
		None
	}
}

/// Appends `addr` to X-Forwarded-For, comma-separated.
pub fn append_xff(headers: &mut HeaderMap, addr: IpAddr) {
	let addr = addr.to_string();
	let value = match headers.get(&x_headers::X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
		Some(existing) if !existing.is_empty() => format!("{existing}, {addr}"),
		_ => addr,
	};
	if let Ok(v) = HeaderValue::try_from(value) {
		headers.insert(x_headers::X_FORWARDED_FOR, v);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn req(uri: &str) -> Request {
		::http::Request::builder()
			.uri(uri)
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn normalize_uses_host_header() {
		let mut r = ::http::Request::builder()
			.uri("/some/path")
			.header(header::HOST, "Foo.Example.com:8080")
			.body(Body::empty())
			.unwrap();
		normalize_uri(&mut r, false).unwrap();
		assert_eq!(get_host(&r).unwrap(), "Foo.Example.com");
		assert_eq!(r.uri().path(), "/some/path");
	}

	#[test]
	fn missing_host_rejected() {
		let mut r = req("/");
		assert!(matches!(
			normalize_uri(&mut r, false),
			Err(ProxyError::EmptyHost)
		));
	}

	#[test]
	fn xff_appends() {
		let mut headers = HeaderMap::new();
		append_xff(&mut headers, "10.1.1.1".parse().unwrap());
		append_xff(&mut headers, "10.2.2.2".parse().unwrap());
		assert_eq!(
			headers.get(&x_headers::X_FORWARDED_FOR).unwrap(),
			"10.1.1.1, 10.2.2.2"
		);
	}

	#[test]
	fn upgrade_requires_connection_header() {
		let mut headers = HeaderMap::new();
		headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
		assert!(upgrade_type(&headers).is_none());
		headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
		assert_eq!(upgrade_type(&headers).unwrap(), "websocket");
	}
}
