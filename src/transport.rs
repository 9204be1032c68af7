//! Byte-range transport used by the chunk workers.
//!
//! The engine only needs one capability from the network: open the range
//! `[offset, offset + length)` of a URL and stream it. [`HttpTransport`] is
//! the reqwest-backed implementation; tests substitute their own.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use thiserror::Error;

/// Stream of body bytes for one requested range.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected status {status} for range {offset}+{length}")]
    UnexpectedStatus { status: u16, offset: u64, length: u64 },
    #[error("server announced {announced} bytes for a {expected} byte range")]
    LengthMismatch { expected: u64, announced: u64 },
    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: u64, received: u64 },
    #[error("server sent more than the {expected} bytes requested")]
    Overrun { expected: u64 },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("no data received for {}s", .idle.as_secs_f32())]
    Stalled { idle: Duration },
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Transient errors are worth another attempt; local I/O failures and
    /// cancellation are not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransferError::Io { .. } | TransferError::Cancelled)
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Range-read capability of the content host.
pub trait RangeTransport: Send + Sync + 'static {
    fn open_range(
        &self,
        url: &str,
        offset: u64,
        length: u64,
    ) -> impl Future<Output = Result<ByteStream, TransferError>> + Send;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// reqwest-backed range client.
///
/// There is no deadline on a whole transfer: a chunk may take as long as it
/// needs while bytes keep arriving. `idle_timeout` bounds the wait for the
/// response head and for every following piece of the body.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    idle_timeout: Duration,
}

impl HttpTransport {
    pub fn new(idle_timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .user_agent(concat!("modelget/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            idle_timeout,
        })
    }
}

/// Fails the stream with `Stalled` when `body` yields nothing for `idle`.
fn with_idle_timeout(body: BoxStream<'static, reqwest::Result<Bytes>>, idle: Duration) -> ByteStream {
    futures_util::stream::unfold(Some(body), move |state| async move {
        let mut body = state?;
        match tokio::time::timeout(idle, body.next()).await {
            Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(body))),
            Ok(Some(Err(e))) => Some((Err(TransferError::from(e)), None)),
            Ok(None) => None,
            Err(_) => Some((Err(TransferError::Stalled { idle }), None)),
        }
    })
    .boxed()
}

impl RangeTransport for HttpTransport {
    async fn open_range(
        &self,
        url: &str,
        offset: u64,
        length: u64,
    ) -> Result<ByteStream, TransferError> {
        let last = offset + length.saturating_sub(1);
        let request = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={}-{}", offset, last))
            .send();
        let resp = tokio::time::timeout(self.idle_timeout, request)
            .await
            .map_err(|_| TransferError::Stalled {
                idle: self.idle_timeout,
            })??;

        // A plain 200 means the server ignored the range; treat it like any
        // other unexpected answer and let the worker retry.
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::UnexpectedStatus {
                status: resp.status().as_u16(),
                offset,
                length,
            });
        }
        if let Some(announced) = resp.content_length() {
            if announced != length {
                return Err(TransferError::LengthMismatch {
                    expected: length,
                    announced,
                });
            }
        }

        Ok(with_idle_timeout(
            resp.bytes_stream().boxed(),
            self.idle_timeout,
        ))
    }
}
