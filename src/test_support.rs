//! One-shot local HTTP server for client tests.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves a single connection: reads the request head, writes `head`, then
/// each body piece after its delay. The connection stays open for `linger`
/// afterwards. Returns `http://127.0.0.1:<port>`.
pub async fn serve_once(head: String, pieces: Vec<(Duration, Vec<u8>)>, linger: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        for (delay, piece) in pieces {
            tokio::time::sleep(delay).await;
            if socket.write_all(&piece).await.is_err() || socket.flush().await.is_err() {
                return;
            }
        }
        tokio::time::sleep(linger).await;
    });
    format!("http://{}", addr)
}

/// A client that ignores proxy settings of the test environment.
pub fn direct_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
