//! Multipart upload sink.
//!
//! Writes are buffered into fixed-size parts and handed to a small pool of
//! worker tasks through a bounded channel; a full channel blocks the
//! producer (backpressure). Shutdown is explicit: after the final part is
//! enqueued, one shutdown message per worker follows it through the same
//! FIFO channel, so every part is processed before any worker exits and no
//! part is silently dropped. `complete` is called exactly once, after all
//! parts are acknowledged.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{CacheSink, Error, Result};

/// Part buffer threshold: writes accumulate until a part this large can be
/// handed to the upload pool.
pub const DEFAULT_PART_SIZE: usize = 50 * 1024 * 1024;

/// Fixed number of upload worker tasks per sink.
const WORKER_COUNT: usize = 4;

/// Bound on the part queue; the producer blocks when it is full.
const QUEUE_CAPACITY: usize = 100;

// =============================================================================
// PartUploader
// =============================================================================

/// An acknowledged part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

/// The remote side of a multipart upload.
#[async_trait]
pub trait PartUploader: Send + Sync + 'static {
    /// Upload one numbered part. Called concurrently from the worker pool.
    async fn upload_part(&self, part_number: i32, data: Bytes) -> Result<UploadedPart>;

    /// Finish the upload from the acknowledged parts, in part order.
    async fn complete(&self, parts: Vec<UploadedPart>) -> Result<()>;

    /// Abandon the upload, discarding any uploaded parts.
    async fn abort(&self) -> Result<()>;
}

// =============================================================================
// Worker pool
// =============================================================================

enum PartMessage {
    Part { number: i32, data: Bytes },
    Shutdown,
}

async fn worker_loop(
    uploader: Arc<dyn PartUploader>,
    rx: Arc<Mutex<mpsc::Receiver<PartMessage>>>,
) -> Result<Vec<UploadedPart>> {
    let mut completed = Vec::new();
    let mut failure: Option<Error> = None;
    loop {
        // Hold the receiver lock only while waiting, never across an upload,
        // so the other workers can keep pulling parts.
        let message = { rx.lock().await.recv().await };
        match message {
            None | Some(PartMessage::Shutdown) => break,
            Some(PartMessage::Part { number, data }) => {
                if failure.is_some() {
                    // Keep draining so the producer never blocks on a full
                    // queue behind a dead worker.
                    continue;
                }
                match uploader.upload_part(number, data).await {
                    Ok(part) => completed.push(part),
                    Err(e) => {
                        warn!(part = number, error = %e, "part upload failed");
                        failure = Some(e);
                    }
                }
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(completed),
    }
}

// =============================================================================
// MultipartSink
// =============================================================================

/// A [`CacheSink`] that streams its input to a [`PartUploader`] through the
/// worker pool.
pub struct MultipartSink {
    uploader: Arc<dyn PartUploader>,
    tx: mpsc::Sender<PartMessage>,
    workers: Vec<JoinHandle<Result<Vec<UploadedPart>>>>,
    buffer: BytesMut,
    part_size: usize,
    next_part: i32,
}

impl MultipartSink {
    /// Create a sink with the standard part size.
    pub fn new(uploader: Arc<dyn PartUploader>) -> Self {
        Self::with_part_size(uploader, DEFAULT_PART_SIZE)
    }

    /// Create a sink with an explicit part size.
    pub fn with_part_size(uploader: Arc<dyn PartUploader>, part_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..WORKER_COUNT)
            .map(|_| tokio::spawn(worker_loop(Arc::clone(&uploader), Arc::clone(&rx))))
            .collect();
        Self {
            uploader,
            tx,
            workers,
            buffer: BytesMut::new(),
            part_size,
            next_part: 1,
        }
    }

    async fn send_part(&mut self, data: Bytes) -> Result<()> {
        let number = self.next_part;
        self.next_part += 1;
        self.tx
            .send(PartMessage::Part { number, data })
            .await
            .map_err(|_| Error::Remote("upload worker pool stopped".to_string()))
    }
}

#[async_trait]
impl CacheSink for MultipartSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.part_size {
            let part = self.buffer.split_to(self.part_size).freeze();
            self.send_part(part).await?;
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<Option<PathBuf>> {
        // Flush the remainder. An upload always has at least one part so an
        // empty object can still be completed.
        if !self.buffer.is_empty() || self.next_part == 1 {
            let part = std::mem::take(&mut self.buffer).freeze();
            self.send_part(part).await?;
        }
        let part_count = self.next_part - 1;

        // All real parts are already in the queue; the shutdown messages
        // queue behind them, one per worker.
        for _ in 0..self.workers.len() {
            self.tx
                .send(PartMessage::Shutdown)
                .await
                .map_err(|_| Error::Remote("upload worker pool stopped".to_string()))?;
        }
        drop(self.tx);

        let mut parts = Vec::with_capacity(part_count as usize);
        let mut failure: Option<Error> = None;
        for result in join_all(self.workers).await {
            match result {
                Ok(Ok(worker_parts)) => parts.extend(worker_parts),
                Ok(Err(e)) => failure = failure.or(Some(e)),
                Err(e) => {
                    failure =
                        failure.or(Some(Error::Remote(format!("upload worker died: {}", e))));
                }
            }
        }

        if let Some(e) = failure {
            if let Err(abort_err) = self.uploader.abort().await {
                warn!(error = %abort_err, "failed to abort multipart upload");
            }
            return Err(e);
        }

        parts.sort_by_key(|p| p.part_number);
        self.uploader.complete(parts).await?;
        info!(parts = part_count, "multipart upload complete");
        Ok(None)
    }
}

// =============================================================================
// Tests
// =============================================================================
