use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

/// Byte counts for a finished bidirectional splice.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpliceResult {
	pub sent: u64,
	pub received: u64,
}

/// Splices bytes between two streams until either side closes, then shuts
/// both down. Used for upgraded (WebSocket/TCP) connections, where no
/// deadlines apply once the tunnel is established.
pub async fn copy_bidirectional<A, B>(downstream: &mut A, upstream: &mut B) -> std::io::Result<SpliceResult>
where
	A: AsyncRead + AsyncWrite + Unpin + ?Sized,
	B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	let (sent, received) = tokio::io::copy_bidirectional(downstream, upstream).await?;
	trace!(sent, received, "splice complete");
	Ok(SpliceResult { sent, received })
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[tokio::test]
	async fn splice_closes_peer_within_deadline() {
		let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let upstream_addr = upstream_listener.local_addr().unwrap();
		let downstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let downstream_addr = downstream_listener.local_addr().unwrap();

		// Echo server on the upstream side.
		tokio::spawn(async move {
			let (mut s, _) = upstream_listener.accept().await.unwrap();
			let mut buf = [0u8; 32];
			loop {
				let n = s.read(&mut buf).await.unwrap();
				if n == 0 {
					return;
				}
				s.write_all(&buf[..n]).await.unwrap();
			}
		});

		let splice = tokio::spawn(async move {
			let (mut down, _) = downstream_listener.accept().await.unwrap();
			let mut up = tokio::net::TcpStream::connect(upstream_addr).await.unwrap();
			copy_bidirectional(&mut down, &mut up).await.unwrap()
		});

		let mut client = tokio::net::TcpStream::connect(downstream_addr).await.unwrap();
		client.write_all(b"ping").await.unwrap();
		let mut got = [0u8; 4];
		client.read_exact(&mut got).await.unwrap();
		assert_eq!(&got, b"ping");

		// Closing the client must unwind the whole tunnel promptly.
		drop(client);
		let res = tokio::time::timeout(std::time::Duration::from_secs(1), splice)
			.await
			.expect("tunnel should close within 1s")
			.unwrap();
		assert_eq!(res.received, 4);
	}
}
