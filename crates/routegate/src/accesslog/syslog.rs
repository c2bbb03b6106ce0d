use std::io;

use router_core::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

/// RFC 5424 allows at most six fractional-second digits.
static SYSLOG_TIMESTAMP: &[BorrowedFormatItem<'static>] = format_description!(
	"[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

const SEVERITY_INFO: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyslogTransport {
	Tcp,
	Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyslogConfig {
	/// `host:port` of the collector.
	pub address: String,
	pub transport: SyslogTransport,
	#[serde(default = "default_app_name")]
	pub app_name: String,
	#[serde(default = "default_facility")]
	pub facility: u8,
}

fn default_app_name() -> String {
	"routegate".to_string()
}

fn default_facility() -> u8 {
	1
}

enum Conn {
	Tcp(Option<TcpStream>),
	Udp(UdpSocket),
}

/// RFC 5424 syslog writer. TCP uses non-transparent framing (trailing LF)
/// and reconnects lazily after a write failure; UDP is fire-and-forget.
pub struct SyslogSink {
	cfg: SyslogConfig,
	hostname: String,
	pid: u32,
	conn: Option<Conn>,
}

impl SyslogSink {
	pub fn new(cfg: SyslogConfig) -> anyhow::Result<SyslogSink> {
		let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "-".to_string());
		Ok(SyslogSink {
			cfg,
			hostname,
			pid: std::process::id(),
			conn: None,
		})
	}

	/// Renders the RFC 5424 header: `<PRI>1 TIMESTAMP HOSTNAME APP-NAME PID - `
	/// followed by the UTF-8 BOM and the message.
	fn frame(&self, timestamp: OffsetDateTime, msg: &str) -> String {
		let pri = self.cfg.facility * 8 + SEVERITY_INFO;
		let ts = timestamp
			.format(&SYSLOG_TIMESTAMP)
			.unwrap_or_else(|_| "-".to_string());
		format!(
			"<{pri}>1 {ts} {host} {app} {pid} - \u{feff}{msg}",
			host = self.hostname,
			app = self.cfg.app_name,
			pid = self.pid,
		)
	}

	pub async fn write(&mut self, timestamp: OffsetDateTime, msg: &str) -> io::Result<()> {
		let frame = self.frame(timestamp, msg);
		match self.cfg.transport {
			SyslogTransport::Udp => {
				if !matches!(self.conn, Some(Conn::Udp(_))) {
					let s = UdpSocket::bind("0.0.0.0:0").await?;
					s.connect(&self.cfg.address).await?;
					self.conn = Some(Conn::Udp(s));
				}
				let Some(Conn::Udp(sock)) = &mut self.conn else {
					unreachable!()
				};
				sock.send(frame.as_bytes()).await?;
				Ok(())
			},
			SyslogTransport::Tcp => {
				if !matches!(self.conn, Some(Conn::Tcp(Some(_)))) {
					let s = TcpStream::connect(&self.cfg.address).await?;
					self.conn = Some(Conn::Tcp(Some(s)));
				}
				let Some(Conn::Tcp(Some(stream))) = &mut self.conn else {
					unreachable!()
				};
				let mut framed = frame.into_bytes();
				framed.push(b'\n');
				if let Err(e) = stream.write_all(&framed).await {
					// Drop the connection; the next record reconnects.
					self.conn = Some(Conn::Tcp(None));
					return Err(e);
				}
				Ok(())
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use time::macros::datetime;
	use tokio::io::AsyncReadExt;

	use super::*;

	fn cfg(address: String, transport: SyslogTransport) -> SyslogConfig {
		SyslogConfig {
			address,
			transport,
			app_name: "routegate".to_string(),
			facility: 1,
		}
	}

	#[test]
	fn frame_has_rfc5424_header_and_bom() {
		let sink = SyslogSink::new(cfg("127.0.0.1:514".into(), SyslogTransport::Udp)).unwrap();
		let ts = datetime!(2024-01-02 03:04:05.123456 UTC);
		let frame = sink.frame(ts, "hello");
		assert!(frame.starts_with("<14>1 2024-01-02T03:04:05.123456Z "));
		let parts: Vec<&str> = frame.splitn(7, ' ').collect();
		assert_eq!(parts[3], "routegate");
		assert_eq!(parts[5], "-");
		assert!(parts[6].starts_with('\u{feff}'));
		assert!(parts[6].ends_with("hello"));
	}

	#[tokio::test]
	async fn tcp_messages_are_newline_framed() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let mut sink = SyslogSink::new(cfg(addr.to_string(), SyslogTransport::Tcp)).unwrap();

		let server = tokio::spawn(async move {
			let (mut s, _) = listener.accept().await.unwrap();
			let mut buf = Vec::new();
			let mut chunk = [0u8; 1024];
			loop {
				let n = s.read(&mut chunk).await.unwrap();
				if n == 0 {
					break;
				}
				buf.extend_from_slice(&chunk[..n]);
				if buf.iter().filter(|b| **b == b'\n').count() == 2 {
					break;
				}
			}
			buf
		});

		let ts = datetime!(2024-01-02 03:04:05.1 UTC);
		sink.write(ts, "first").await.unwrap();
		sink.write(ts, "second").await.unwrap();
		drop(sink);

		let buf = server.await.unwrap();
		let text = String::from_utf8(buf).unwrap();
		let lines: Vec<&str> = text.split_terminator('\n').collect();
		assert_eq!(lines.len(), 2);
		assert!(lines[0].ends_with("first"));
		assert!(lines[1].ends_with("second"));
	}

	#[tokio::test]
	async fn udp_sends_datagram_per_record() {
		let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let addr = server.local_addr().unwrap();
		let mut sink = SyslogSink::new(cfg(addr.to_string(), SyslogTransport::Udp)).unwrap();
		sink
			.write(datetime!(2024-01-02 03:04:05.1 UTC), "datagram")
			.await
			.unwrap();
		let mut buf = [0u8; 2048];
		let (n, _) = server.recv_from(&mut buf).await.unwrap();
		let text = std::str::from_utf8(&buf[..n]).unwrap();
		assert!(text.starts_with("<14>1 "));
		assert!(text.ends_with("datagram"));
		assert!(!text.ends_with('\n'));
	}
}
