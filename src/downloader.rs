use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use futures_util::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::{Chunk, ChunkState, ChunkTarget};
use crate::state_manager::{StateError, StatusStore};
use crate::transport::{RangeTransport, TransferError};

/// Delay before retry number `retry` (0-based): `base * 2^retry`.
pub fn retry_delay(retry: u32, base: Duration) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(retry))
}

/// How one chunk ended. The chunk carries its final state and attempt count.
#[derive(Debug)]
pub enum ChunkOutcome {
    Done(Chunk),
    /// Retries exhausted, or a local error that is not worth retrying.
    Failed(Chunk, TransferError),
    Cancelled(Chunk),
    /// The progress could not be recorded; the chunk is not trusted.
    StoreFailed(Chunk, StateError),
}

/// Transfers single byte ranges into pre-allocated files and reports
/// progress to the status store.
pub struct ChunkWorker<T, S> {
    transport: Arc<T>,
    store: Arc<S>,
    /// Job-wide bound on concurrent range requests.
    slots: Arc<Semaphore>,
    retry_limit: u32,
    retry_backoff: Duration,
    cancel: CancellationToken,
}

impl<T, S> Clone for ChunkWorker<T, S> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            store: self.store.clone(),
            slots: self.slots.clone(),
            retry_limit: self.retry_limit,
            retry_backoff: self.retry_backoff,
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: RangeTransport, S: StatusStore> ChunkWorker<T, S> {
    pub fn new(
        transport: Arc<T>,
        store: Arc<S>,
        slots: Arc<Semaphore>,
        retry_limit: u32,
        retry_backoff: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            store,
            slots,
            retry_limit,
            retry_backoff,
            cancel,
        }
    }

    /// Downloads `chunk` into `target.part_path` at its offset, retrying
    /// transient failures with exponential backoff.
    ///
    /// `Done` is recorded only after the bytes are synced to disk. A chunk
    /// that is already `Done` is returned untouched.
    pub async fn fetch(&self, target: &ChunkTarget, mut chunk: Chunk) -> ChunkOutcome {
        if chunk.is_done() {
            return ChunkOutcome::Done(chunk);
        }

        let mut retries = 0u32;
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.abandon(target, chunk).await,
                permit = self.slots.acquire() => permit,
            };
            let Ok(permit) = permit else {
                return self.abandon(target, chunk).await;
            };

            chunk.attempts += 1;
            chunk.state = ChunkState::InFlight;
            if let Err(e) = self.record(target, &chunk).await {
                return ChunkOutcome::StoreFailed(chunk, e);
            }

            let result = self.transfer_once(target, &chunk).await;
            drop(permit);

            match result {
                Ok(written) => {
                    chunk.state = ChunkState::Done;
                    if let Err(e) = self.record(target, &chunk).await {
                        return ChunkOutcome::StoreFailed(chunk, e);
                    }
                    debug!(
                        file = %target.remote_path,
                        offset = chunk.offset,
                        bytes = written,
                        attempts = chunk.attempts,
                        "chunk done"
                    );
                    return ChunkOutcome::Done(chunk);
                }
                Err(TransferError::Cancelled) => return self.abandon(target, chunk).await,
                Err(e) if e.is_transient() && retries < self.retry_limit => {
                    let delay = retry_delay(retries, self.retry_backoff);
                    retries += 1;
                    warn!(
                        file = %target.remote_path,
                        offset = chunk.offset,
                        attempt = chunk.attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "chunk transfer failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return self.abandon(target, chunk).await,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    chunk.state = ChunkState::Failed;
                    warn!(
                        file = %target.remote_path,
                        offset = chunk.offset,
                        attempts = chunk.attempts,
                        error = %e,
                        "chunk failed"
                    );
                    if let Err(store_err) = self.record(target, &chunk).await {
                        warn!(file = %target.remote_path, error = %store_err, "could not record chunk failure");
                    }
                    return ChunkOutcome::Failed(chunk, e);
                }
            }
        }
    }

    /// One attempt: request the range and stream it to its offset.
    async fn transfer_once(&self, target: &ChunkTarget, chunk: &Chunk) -> Result<u64, TransferError> {
        let mut body = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            body = self.transport.open_range(&target.url, chunk.offset, chunk.length) => body?,
        };

        let path = &target.part_path;
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        file.seek(SeekFrom::Start(chunk.offset))
            .await
            .map_err(|e| TransferError::io(path, e))?;

        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                next = body.next() => next,
            };
            let Some(bytes) = next else { break };
            let bytes = bytes?;
            if written + bytes.len() as u64 > chunk.length {
                return Err(TransferError::Overrun { expected: chunk.length });
            }
            file.write_all(&bytes)
                .await
                .map_err(|e| TransferError::io(path, e))?;
            written += bytes.len() as u64;
        }

        if written != chunk.length {
            return Err(TransferError::ShortRead {
                expected: chunk.length,
                received: written,
            });
        }

        file.flush().await.map_err(|e| TransferError::io(path, e))?;
        file.sync_data().await.map_err(|e| TransferError::io(path, e))?;
        Ok(written)
    }

    async fn record(&self, target: &ChunkTarget, chunk: &Chunk) -> Result<(), StateError> {
        self.store
            .record_chunk(
                &target.model_id,
                &target.remote_path,
                chunk.offset,
                chunk.state,
                chunk.attempts,
            )
            .await
    }

    /// Gives the chunk back as pending. Whatever was written for it is
    /// ignored on the next run.
    async fn abandon(&self, target: &ChunkTarget, mut chunk: Chunk) -> ChunkOutcome {
        chunk.state = ChunkState::Pending;
        if let Err(e) = self.record(target, &chunk).await {
            debug!(file = %target.remote_path, offset = chunk.offset, error = %e, "could not release chunk");
        }
        ChunkOutcome::Cancelled(chunk)
    }
}
