pub mod syslog;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use http::{Method, StatusCode};
use router_core::prelude::*;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::telemetry::metrics::Metrics;

/// Rendered-for-envelope records must stay under one UDP datagram.
const ENVELOPE_BUDGET: usize = 65_400;
const BROWSER_HEADER_CEILING: usize = 1_000;
const USER_FIELD_CEILING: usize = 20_000;

static TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
	"[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryRedaction {
	#[default]
	None,
	/// Strip the query string entirely.
	All,
	/// Replace the query string with `hash=<sha1 hex>`.
	Hash,
}

#[derive(Debug, Clone)]
pub struct AccessLogConfig {
	pub file: Option<PathBuf>,
	pub syslog: Option<syslog::SyslogConfig>,
	pub envelope: bool,
	pub redact_query: QueryRedaction,
	/// Request headers appended to each record as `name:"value"`.
	pub extra_headers: Vec<Strng>,
	pub attempt_details: bool,
	pub capacity: usize,
}

impl Default for AccessLogConfig {
	fn default() -> Self {
		AccessLogConfig {
			file: None,
			syslog: None,
			envelope: false,
			redact_query: QueryRedaction::None,
			extra_headers: Vec::new(),
			attempt_details: false,
			capacity: 1024,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct AttemptDetails {
	pub failed_attempts: u32,
	pub failed_attempts_time: Duration,
	pub dns_time: Option<Duration>,
	pub dial_time: Option<Duration>,
	pub tls_time: Option<Duration>,
	pub backend_time: Option<Duration>,
}

/// One fully-assembled access-log record. Field order and rendering are a
/// wire contract; see `render`.
#[derive(Debug, Clone)]
pub struct Record {
	pub host: String,
	pub timestamp: OffsetDateTime,
	pub method: Option<Method>,
	pub uri: String,
	pub protocol: Option<String>,
	pub status: Option<StatusCode>,
	pub request_bytes: Option<u64>,
	pub body_bytes: u64,
	pub referer: Option<String>,
	pub user_agent: Option<String>,
	pub remote_addr: Option<String>,
	pub backend_addr: Option<String>,
	pub x_forwarded_for: Option<String>,
	pub x_forwarded_proto: Option<String>,
	pub vcap_request_id: Option<String>,
	pub response_time: Option<Duration>,
	pub router_time: Option<Duration>,
	pub app_id: Option<String>,
	pub app_index: Option<String>,
	pub instance_id: Option<String>,
	pub router_error: Option<String>,
	pub extra_headers: Vec<(String, Option<String>)>,
	pub attempts: Option<AttemptDetails>,
}

fn escape_into(out: &mut String, v: &str) {
	for c in v.chars() {
		match c {
			'"' => out.push_str("\\\""),
			'\\' => out.push_str("\\\\"),
			c => out.push(c),
		}
	}
}

fn push_quoted(out: &mut String, v: Option<&str>) {
	out.push('"');
	match v {
		Some(v) => escape_into(out, v),
		None => out.push('-'),
	}
	out.push('"');
}

fn push_kv_quoted(out: &mut String, key: &str, v: Option<&str>) {
	out.push_str(key);
	out.push(':');
	push_quoted(out, v);
}

fn push_float(out: &mut String, v: Option<Duration>) {
	match v {
		Some(d) => {
			use std::fmt::Write;
			let _ = write!(out, "{:.6}", d.as_secs_f64());
		},
		None => out.push('-'),
	}
}

impl Record {
	/// The untruncated line written to file and syslog sinks.
	pub fn render(&self) -> String {
		self.render_with(
			&self.uri,
			self.referer.as_deref(),
			self.user_agent.as_deref(),
			&self.extra_headers,
		)
	}

	/// The envelope rendering: identical format, but URI and header values are
	/// iteratively truncated until the line fits the UDP-safety budget.
	pub fn render_enveloped(&self) -> String {
		#[derive(Clone)]
		struct Field {
			sentinel_name: String,
			ceiling: usize,
			value: String,
			present: bool,
		}
		let mk = |name: &str, ceiling: usize, value: Option<&str>| Field {
			sentinel_name: name.to_string(),
			ceiling,
			value: value.unwrap_or_default().to_string(),
			present: value.is_some(),
		};
		let mut uri = mk("REQUEST-URI", USER_FIELD_CEILING, Some(&self.uri));
		let mut referer = mk("REFERER", BROWSER_HEADER_CEILING, self.referer.as_deref());
		let mut user_agent = mk(
			"USER-AGENT",
			BROWSER_HEADER_CEILING,
			self.user_agent.as_deref(),
		);
		let mut extras: Vec<Field> = self
			.extra_headers
			.iter()
			.map(|(name, v)| {
				mk(
					&name.to_ascii_uppercase(),
					USER_FIELD_CEILING,
					v.as_deref(),
				)
			})
			.collect();

		let render = |uri: &Field, referer: &Field, user_agent: &Field, extras: &[Field]| {
			let extra_pairs: Vec<(String, Option<String>)> = self
				.extra_headers
				.iter()
				.zip(extras.iter())
				.map(|((name, _), f)| (name.clone(), f.present.then(|| f.value.clone())))
				.collect();
			self.render_with(
				&uri.value,
				referer.present.then_some(referer.value.as_str()),
				user_agent.present.then_some(user_agent.value.as_str()),
				&extra_pairs,
			)
		};

		// First pass: clamp each field to its ceiling.
		{
			let mut all: Vec<&mut Field> = Vec::new();
			all.push(&mut uri);
			all.push(&mut referer);
			all.push(&mut user_agent);
			all.extend(extras.iter_mut());
			for f in all {
				if f.value.len() > f.ceiling {
					let target = f.ceiling;
					truncate_field(&mut f.value, target, &f.sentinel_name);
				}
			}
		}

		let mut line = render(&uri, &referer, &user_agent, &extras);
		// Then halve the longest offender until the line fits.
		while line.len() > ENVELOPE_BUDGET {
			let longest = {
				let mut all: Vec<&mut Field> = Vec::new();
				all.push(&mut uri);
				all.push(&mut referer);
				all.push(&mut user_agent);
				all.extend(extras.iter_mut());
				all.into_iter().max_by_key(|f| f.value.len())
			};
			let Some(f) = longest else { break };
			let target = f.value.len() / 2;
			if target <= f.sentinel_name.len() + 40 {
				break;
			}
			truncate_field(&mut f.value, target, &f.sentinel_name);
			line = render(&uri, &referer, &user_agent, &extras);
		}
		line
	}

	fn render_with(
		&self,
		uri: &str,
		referer: Option<&str>,
		user_agent: Option<&str>,
		extra_headers: &[(impl AsRef<str>, Option<String>)],
	) -> String {
		use std::fmt::Write;
		let mut out = String::with_capacity(256);
		out.push_str(&self.host);
		out.push_str(" - [");
		match self.timestamp.format(&TIMESTAMP_FORMAT) {
			Ok(ts) => out.push_str(&ts),
			Err(_) => out.push('-'),
		}
		out.push_str("] \"");
		match &self.method {
			Some(m) => out.push_str(m.as_str()),
			None => out.push('-'),
		}
		out.push(' ');
		escape_into(&mut out, uri);
		out.push(' ');
		match &self.protocol {
			Some(p) => out.push_str(p),
			None => out.push('-'),
		}
		out.push('"');
		match self.status {
			Some(s) => {
				let _ = write!(out, " {}", s.as_u16());
			},
			None => out.push_str(" -"),
		}
		match self.request_bytes {
			Some(n) => {
				let _ = write!(out, " {n}");
			},
			None => out.push_str(" -"),
		}
		let _ = write!(out, " {}", self.body_bytes);
		out.push(' ');
		push_quoted(&mut out, referer);
		out.push(' ');
		push_quoted(&mut out, user_agent);
		out.push(' ');
		push_quoted(&mut out, self.remote_addr.as_deref());
		out.push(' ');
		push_quoted(&mut out, self.backend_addr.as_deref());
		out.push(' ');
		push_kv_quoted(&mut out, "x_forwarded_for", self.x_forwarded_for.as_deref());
		out.push(' ');
		push_kv_quoted(
			&mut out,
			"x_forwarded_proto",
			self.x_forwarded_proto.as_deref(),
		);
		out.push(' ');
		push_kv_quoted(&mut out, "vcap_request_id", self.vcap_request_id.as_deref());
		out.push_str(" response_time:");
		push_float(&mut out, self.response_time);
		out.push_str(" gorouter_time:");
		push_float(&mut out, self.router_time);
		out.push(' ');
		push_kv_quoted(&mut out, "app_id", self.app_id.as_deref());
		out.push(' ');
		push_kv_quoted(&mut out, "app_index", self.app_index.as_deref());
		out.push(' ');
		push_kv_quoted(&mut out, "instance_id", self.instance_id.as_deref());
		out.push(' ');
		push_kv_quoted(&mut out, "x_cf_routererror", self.router_error.as_deref());
		for (name, value) in extra_headers {
			out.push(' ');
			push_kv_quoted(&mut out, name.as_ref(), value.as_deref());
		}
		if let Some(a) = &self.attempts {
			let _ = write!(out, " failed_attempts:{}", a.failed_attempts);
			out.push_str(" failed_attempts_time:");
			push_float(&mut out, Some(a.failed_attempts_time));
			out.push_str(" dns_time:");
			push_float(&mut out, a.dns_time);
			out.push_str(" dial_time:");
			push_float(&mut out, a.dial_time);
			out.push_str(" tls_time:");
			push_float(&mut out, a.tls_time);
			out.push_str(" backend_time:");
			push_float(&mut out, a.backend_time);
		}
		out
	}
}

fn truncate_field(value: &mut String, target: usize, name: &str) {
	let sentinel = format!("...{name}-TOO-LONG-TO-LOG--TRUNCATED");
	let mut keep = target.saturating_sub(sentinel.len());
	while keep > 0 && !value.is_char_boundary(keep) {
		keep -= 1;
	}
	value.truncate(keep);
	value.push_str(&sentinel);
}

/// Applies the configured redaction to a request target. Only GET requests
/// with a query string are affected.
pub fn redact_query(uri: &str, method: &Method, mode: QueryRedaction) -> String {
	if *method != Method::GET || mode == QueryRedaction::None {
		return uri.to_string();
	}
	let Some((path, query)) = uri.split_once('?') else {
		return uri.to_string();
	};
	match mode {
		QueryRedaction::None => unreachable!(),
		QueryRedaction::All => path.to_string(),
		QueryRedaction::Hash => {
			let digest = Sha1::digest(query.as_bytes());
			format!("{path}?hash={}", hex::encode(digest))
		},
	}
}

/// Emitter for the platform log-envelope sink; the concrete transport is an
/// external collaborator, only the capture surface lives here.
pub trait EnvelopeEmitter: Send + 'static {
	fn emit(&mut self, app_id: Option<&str>, line: &str);
}

struct TracingEmitter;

impl EnvelopeEmitter for TracingEmitter {
	fn emit(&mut self, app_id: Option<&str>, line: &str) {
		info!(target: "access_envelope", app_id, "{line}");
	}
}

enum Sink {
	File(tokio::fs::File),
	Syslog(syslog::SyslogSink),
	Envelope(Box<dyn EnvelopeEmitter>),
}

impl Sink {
	/// Files get the untruncated line; syslog and the envelope emitter use the
	/// length-bounded rendering, shared via `truncated`.
	async fn write(&mut self, record: &Record, line: &str, truncated: &mut Option<String>) {
		match self {
			Sink::File(f) => {
				let mut framed = String::with_capacity(line.len() + 1);
				framed.push_str(line);
				framed.push('\n');
				if let Err(e) = f.write_all(framed.as_bytes()).await {
					warn!("access log file write failed: {e}");
				}
			},
			Sink::Syslog(s) => {
				let msg = truncated.get_or_insert_with(|| record.render_enveloped());
				if let Err(e) = s.write(record.timestamp, msg).await {
					warn!("access log syslog write failed: {e}");
				}
			},
			Sink::Envelope(e) => {
				let msg = truncated.get_or_insert_with(|| record.render_enveloped());
				e.emit(record.app_id.as_deref(), msg);
			},
		}
	}
}

/// Bounded, lossy-by-design fan-out. The request path enqueues with
/// `try_send`; a full channel drops the record and bumps a counter rather
/// than ever blocking a request.
#[derive(Clone)]
pub struct Pipeline {
	tx: Option<mpsc::Sender<Record>>,
	metrics: Arc<Metrics>,
}

impl Pipeline {
	/// A pipeline with no sinks; emit is a no-op.
	pub fn disabled(metrics: Arc<Metrics>) -> Pipeline {
		Pipeline { tx: None, metrics }
	}

	/// The channel half only; callers drain the receiver themselves.
	pub fn bounded(capacity: usize, metrics: Arc<Metrics>) -> (Pipeline, mpsc::Receiver<Record>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		(
			Pipeline {
				tx: Some(tx),
				metrics,
			},
			rx,
		)
	}

	pub fn emit(&self, record: Record) {
		let Some(tx) = &self.tx else { return };
		if tx.try_send(record).is_err() {
			self.metrics.dropped_access_logs.inc();
		}
	}

	/// Builds the sinks from config and spawns the single consumer task.
	/// The task exits once every Pipeline clone has dropped.
	pub async fn spawn(
		cfg: &AccessLogConfig,
		metrics: Arc<Metrics>,
	) -> anyhow::Result<(Pipeline, tokio::task::JoinHandle<()>)> {
		let mut sinks: Vec<Sink> = Vec::new();
		if let Some(path) = &cfg.file {
			let file = tokio::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(path)
				.await
				.with_context(|| format!("open access log {}", path.display()))?;
			sinks.push(Sink::File(file));
		}
		if let Some(syslog_cfg) = &cfg.syslog {
			sinks.push(Sink::Syslog(syslog::SyslogSink::new(syslog_cfg.clone())?));
		}
		if cfg.envelope {
			sinks.push(Sink::Envelope(Box::new(TracingEmitter)));
		}
		if sinks.is_empty() {
			return Ok((Pipeline::disabled(metrics), tokio::spawn(async {})));
		}

		let (pipeline, mut rx) = Pipeline::bounded(cfg.capacity, metrics);
		let handle = tokio::spawn(async move {
			while let Some(record) = rx.recv().await {
				let line = record.render();
				let mut truncated = None;
				for sink in sinks.iter_mut() {
					sink.write(&record, &line, &mut truncated).await;
				}
			}
			for sink in sinks.iter_mut() {
				if let Sink::File(f) = sink {
					let _ = f.flush().await;
				}
			}
			debug!("access log pipeline stopped");
		});
		Ok((pipeline, handle))
	}
}

/// Mutable per-request log state, filled in as the pipeline advances and
/// flushed into a [`Record`] when the response body completes.
pub struct RequestLog {
	pipeline: Pipeline,
	cfg: Arc<AccessLogConfig>,
	pub start: Instant,
	pub timestamp: OffsetDateTime,
	pub host: Option<String>,
	pub method: Option<Method>,
	pub uri: Option<String>,
	pub protocol: Option<String>,
	pub status: Option<StatusCode>,
	pub request_bytes: Option<u64>,
	pub referer: Option<String>,
	pub user_agent: Option<String>,
	pub remote_addr: Option<String>,
	pub backend_addr: Option<String>,
	pub x_forwarded_for: Option<String>,
	pub x_forwarded_proto: Option<String>,
	pub vcap_request_id: Option<String>,
	pub app_id: Option<String>,
	pub app_index: Option<String>,
	pub instance_id: Option<String>,
	pub router_error: Option<&'static str>,
	pub extra_headers: Vec<(String, Option<String>)>,
	pub attempts: AttemptDetails,
	pub body_bytes: Arc<AtomicU64>,
	/// Health probes and outbound detour legs emit no record.
	pub suppress: bool,
}

impl RequestLog {
	pub fn new(pipeline: Pipeline, cfg: Arc<AccessLogConfig>) -> RequestLog {
		RequestLog {
			pipeline,
			cfg,
			start: Instant::now(),
			timestamp: OffsetDateTime::now_utc(),
			host: None,
			method: None,
			uri: None,
			protocol: None,
			status: None,
			request_bytes: None,
			referer: None,
			user_agent: None,
			remote_addr: None,
			backend_addr: None,
			x_forwarded_for: None,
			x_forwarded_proto: None,
			vcap_request_id: None,
			app_id: None,
			app_index: None,
			instance_id: None,
			router_error: None,
			extra_headers: Vec::new(),
			attempts: AttemptDetails::default(),
			body_bytes: Arc::new(AtomicU64::new(0)),
			suppress: false,
		}
	}

	fn finish(self) {
		if self.suppress {
			return;
		}
		let response_time = Some(self.start.elapsed());
		let router_time = match (response_time, self.attempts.backend_time) {
			(Some(total), Some(backend)) => Some(total.saturating_sub(backend)),
			(total, None) => total,
			_ => None,
		};
		let uri = match (&self.uri, &self.method) {
			(Some(uri), Some(method)) => redact_query(uri, method, self.cfg.redact_query),
			(Some(uri), None) => uri.clone(),
			_ => "-".to_string(),
		};
		let record = Record {
			host: self.host.unwrap_or_else(|| "-".to_string()),
			timestamp: self.timestamp,
			method: self.method,
			uri,
			protocol: self.protocol,
			status: self.status,
			request_bytes: self.request_bytes,
			body_bytes: self.body_bytes.load(Ordering::Relaxed),
			referer: self.referer,
			user_agent: self.user_agent,
			remote_addr: self.remote_addr,
			backend_addr: self.backend_addr,
			x_forwarded_for: self.x_forwarded_for,
			x_forwarded_proto: self.x_forwarded_proto,
			vcap_request_id: self.vcap_request_id,
			response_time,
			router_time,
			app_id: self.app_id,
			app_index: self.app_index,
			instance_id: self.instance_id,
			router_error: self.router_error.map(str::to_string),
			extra_headers: self.extra_headers,
			attempts: self.cfg.attempt_details.then_some(self.attempts),
		};
		self.pipeline.emit(record);
	}
}

impl Debug for RequestLog {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RequestLog")
			.field("host", &self.host)
			.field("status", &self.status)
			.finish_non_exhaustive()
	}
}

/// Owns a RequestLog and emits it exactly once, when dropped. Wrapping the
/// response body in [`LogBody`] defers that drop until the last byte has been
/// streamed to the client.
#[derive(Debug)]
pub struct DropOnLog {
	log: Option<RequestLog>,
}

impl DropOnLog {
	pub fn as_mut(&mut self) -> Option<&mut RequestLog> {
		self.log.as_mut()
	}

	pub fn with(&mut self, f: impl FnOnce(&mut RequestLog)) {
		if let Some(l) = self.log.as_mut() {
			f(l)
		}
	}
}

impl From<RequestLog> for DropOnLog {
	fn from(log: RequestLog) -> Self {
		Self { log: Some(log) }
	}
}

impl Drop for DropOnLog {
	fn drop(&mut self) {
		if let Some(log) = self.log.take() {
			log.finish();
		}
	}
}

pin_project_lite::pin_project! {
	/// Response body wrapper: counts streamed bytes and carries the log to the
	/// end of the stream.
	pub struct LogBody<B> {
		#[pin]
		body: B,
		counter: Arc<AtomicU64>,
		log: Option<DropOnLog>,
	}
}

impl<B> LogBody<B> {
	pub fn new(body: B, mut log: DropOnLog) -> Self {
		let counter = log
			.as_mut()
			.map(|l| l.body_bytes.clone())
			.unwrap_or_default();
		Self {
			body,
			counter,
			log: Some(log),
		}
	}
}

impl<B: http_body::Body> http_body::Body for LogBody<B> {
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let result = ready!(this.body.poll_frame(cx));
		match result {
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref() {
					use bytes::Buf;
					this.counter.fetch_add(data.remaining() as u64, Ordering::Relaxed);
				}
				Poll::Ready(Some(Ok(frame)))
			},
			other => {
				// Stream finished (or failed): flush the record now.
				this.log.take();
				Poll::Ready(other)
			},
		}
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.body.size_hint()
	}
}

#[cfg(test)]
mod tests {
	use time::macros::datetime;

	use super::*;

	fn base_record() -> Record {
		Record {
			host: "foo.example.com".into(),
			timestamp: datetime!(2024-01-02 03:04:05.123456789 UTC),
			method: Some(Method::GET),
			uri: "/some/path?q=1".into(),
			protocol: Some("HTTP/1.1".into()),
			status: Some(StatusCode::OK),
			request_bytes: Some(0),
			body_bytes: 12,
			referer: None,
			user_agent: Some("curl/8".into()),
			remote_addr: Some("10.9.9.9:53000".into()),
			backend_addr: Some("10.0.0.1:8080".into()),
			x_forwarded_for: Some("10.9.9.9".into()),
			x_forwarded_proto: Some("http".into()),
			vcap_request_id: Some("uuid-1".into()),
			response_time: Some(Duration::from_micros(1500)),
			router_time: Some(Duration::from_micros(100)),
			app_id: Some("".into()),
			app_index: Some("0".into()),
			instance_id: Some("i-1".into()),
			router_error: None,
			extra_headers: Vec::new(),
			attempts: None,
		}
	}

	#[test]
	fn renders_exact_line() {
		let line = base_record().render();
		assert_eq!(
			line,
			"foo.example.com - [2024-01-02T03:04:05.123456789Z] \"GET /some/path?q=1 HTTP/1.1\" 200 0 12 \
			 \"-\" \"curl/8\" \"10.9.9.9:53000\" \"10.0.0.1:8080\" \
			 x_forwarded_for:\"10.9.9.9\" x_forwarded_proto:\"http\" vcap_request_id:\"uuid-1\" \
			 response_time:0.001500 gorouter_time:0.000100 \
			 app_id:\"\" app_index:\"0\" instance_id:\"i-1\" x_cf_routererror:\"-\""
		);
	}

	#[test]
	fn zero_duration_renders_six_zeros() {
		let mut r = base_record();
		r.response_time = Some(Duration::ZERO);
		assert!(r.render().contains("response_time:0.000000"));
	}

	#[test]
	fn attempt_details_append() {
		let mut r = base_record();
		r.attempts = Some(AttemptDetails {
			failed_attempts: 1,
			failed_attempts_time: Duration::from_millis(2),
			dns_time: None,
			dial_time: Some(Duration::from_micros(500)),
			tls_time: None,
			backend_time: Some(Duration::from_millis(1)),
		});
		let line = r.render();
		assert!(line.contains("failed_attempts:1"));
		assert!(line.contains("failed_attempts_time:0.002000"));
		assert!(line.contains("dns_time:-"));
		assert!(line.contains("dial_time:0.000500"));
		assert!(line.contains("backend_time:0.001000"));
	}

	#[test]
	fn long_uri_truncated_only_for_envelope() {
		let mut r = base_record();
		r.uri = format!("/{}", "a".repeat(100_000));
		let file_line = r.render();
		assert!(!file_line.contains("TRUNCATED"));
		assert!(file_line.len() > ENVELOPE_BUDGET);

		let env_line = r.render_enveloped();
		assert!(env_line.len() <= ENVELOPE_BUDGET);
		assert!(env_line.contains("...REQUEST-URI-TOO-LONG-TO-LOG--TRUNCATED"));
	}

	#[test]
	fn browser_headers_clamped_at_ceiling() {
		let mut r = base_record();
		r.user_agent = Some("u".repeat(5_000));
		let env_line = r.render_enveloped();
		assert!(env_line.contains("...USER-AGENT-TOO-LONG-TO-LOG--TRUNCATED"));
		// The untruncated rendering keeps the full header.
		assert!(r.render().contains(&"u".repeat(5_000)));
	}

	#[test]
	fn query_redaction_modes() {
		let m = Method::GET;
		assert_eq!(
			redact_query("/p?a=1&b=2", &m, QueryRedaction::None),
			"/p?a=1&b=2"
		);
		assert_eq!(redact_query("/p?a=1&b=2", &m, QueryRedaction::All), "/p");
		let hashed = redact_query("/p?a=1&b=2", &m, QueryRedaction::Hash);
		assert!(hashed.starts_with("/p?hash="));
		assert_eq!(hashed.len(), "/p?hash=".len() + 40);
		// Non-GET requests are never redacted.
		assert_eq!(
			redact_query("/p?a=1", &Method::POST, QueryRedaction::All),
			"/p?a=1"
		);
	}

	#[test]
	fn escaping_quotes_and_backslashes() {
		let mut r = base_record();
		r.user_agent = Some(r#"agent "quoted" \slash"#.into());
		let line = r.render();
		assert!(line.contains(r#""agent \"quoted\" \\slash""#));
	}

	fn test_metrics() -> Arc<Metrics> {
		let mut reg = prometheus_client::registry::Registry::default();
		Arc::new(Metrics::new(&mut reg))
	}

	#[tokio::test]
	async fn full_channel_drops_and_counts() {
		let metrics = test_metrics();
		let (pipeline, _rx) = Pipeline::bounded(1, metrics.clone());
		pipeline.emit(base_record());
		assert_eq!(metrics.dropped_access_logs.get(), 0);
		// Channel capacity is 1 and nothing drains it: the next emit drops.
		pipeline.emit(base_record());
		assert_eq!(metrics.dropped_access_logs.get(), 1);
		pipeline.emit(base_record());
		assert_eq!(metrics.dropped_access_logs.get(), 2);
	}

	#[tokio::test]
	async fn suppressed_log_emits_nothing() {
		let metrics = test_metrics();
		let (pipeline, mut rx) = Pipeline::bounded(4, metrics);
		let mut log = RequestLog::new(pipeline, Arc::new(AccessLogConfig::default()));
		log.suppress = true;
		drop(DropOnLog::from(log));
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn body_completion_flushes_record() {
		use http_body_util::BodyExt;

		let metrics = test_metrics();
		let (pipeline, mut rx) = Pipeline::bounded(4, metrics);
		let mut log = RequestLog::new(pipeline, Arc::new(AccessLogConfig::default()));
		log.host = Some("foo.example.com".into());
		log.status = Some(StatusCode::OK);
		let body = crate::http::Body::from("hello world!");
		let mut wrapped = LogBody::new(body, DropOnLog::from(log));
		// Nothing is emitted until the stream completes.
		assert!(rx.try_recv().is_err());
		while let Some(frame) = wrapped.frame().await {
			frame.unwrap();
		}
		let record = rx.try_recv().unwrap();
		assert_eq!(record.body_bytes, 12);
		assert_eq!(record.host, "foo.example.com");
	}
}
