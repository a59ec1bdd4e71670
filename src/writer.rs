//! Dedicated writer task for one connection.
//!
//! Every call on a connection shares one write half. Instead of locking it,
//! producers hand frames to a single writer task over an mpsc channel; the
//! task drains whatever is queued and writes it with one vectored write.
//!
//! ```text
//! Call 1 ─┐
//! Call 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► socket
//! Call N ─┘
//! ```
//!
//! Backpressure: each queued frame holds a semaphore permit until it has been
//! written. When `max_pending_frames` permits are out, senders wait up to
//! `backpressure_timeout` and then fail with
//! [`RpcError::BackpressureTimeout`].

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{Result, RpcError};
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    header: [u8; HEADER_SIZE],
    payload: Bytes,
    _permit: Option<OwnedSemaphorePermit>,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
            _permit: None,
        }
    }

    /// Create a new outbound frame with empty payload.
    #[inline]
    pub fn empty(header: &Header) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum queued frames before senders wait.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// How long a sender waits for queue space, in milliseconds.
    pub backpressure_timeout_ms: u64,
}

impl WriterConfig {
    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Handle for queueing frames on the writer task.
///
/// Cheaply cloneable; every call on the connection holds one.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<Semaphore>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame, waiting for backpressure to clear if necessary.
    pub async fn send(&self, mut frame: OutboundFrame) -> Result<()> {
        let permit = match self.pending.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => tokio::time::timeout(self.timeout, self.pending.clone().acquire_owned())
                .await
                .map_err(|_| RpcError::BackpressureTimeout)?
                .map_err(|_| RpcError::ConnectionClosed)?,
        };
        frame._permit = Some(permit);

        self.tx
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Queue a control frame without waiting.
    ///
    /// Used from synchronous contexts (drop guards) for `CANCEL` and `END`.
    /// Control frames are not counted against `max_pending_frames`.
    pub fn try_send_control(&self, frame: OutboundFrame) -> Result<()> {
        try_send_control(&self.tx, frame)
    }

    /// A handle that does not keep the writer task running.
    pub fn downgrade(&self) -> WeakWriterHandle {
        WeakWriterHandle {
            tx: self.tx.downgrade(),
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.available_permits() == 0
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.max_pending - self.pending.available_permits()
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Control-frame handle for tasks that must not hold the connection open,
/// such as the caller's reader.
#[derive(Clone)]
pub struct WeakWriterHandle {
    tx: mpsc::WeakSender<OutboundFrame>,
}

impl WeakWriterHandle {
    /// [`WriterHandle::try_send_control`], failing with
    /// [`RpcError::ConnectionClosed`] once every strong handle is gone.
    pub fn try_send_control(&self, frame: OutboundFrame) -> Result<()> {
        let tx = self.tx.upgrade().ok_or(RpcError::ConnectionClosed)?;
        try_send_control(&tx, frame)
    }
}

fn try_send_control(tx: &mpsc::Sender<OutboundFrame>, frame: OutboundFrame) -> Result<()> {
    tx.try_send(frame).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => RpcError::BackpressureTimeout,
        mpsc::error::TrySendError::Closed(_) => RpcError::ConnectionClosed,
    })
}

/// Spawn the writer task and return a handle for queueing frames.
///
/// The task ends cleanly once every [`WriterHandle`] is dropped, or with an
/// error when the underlying write fails.
pub fn spawn_writer_task<W>(writer: W, config: &WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let max_pending = config.max_pending_frames.max(1);

    let handle = WriterHandle {
        tx,
        pending: Arc::new(Semaphore::new(max_pending)),
        max_pending,
        timeout: config.backpressure_timeout(),
    };

    let task = tokio::spawn(writer_loop(rx, writer));

    (handle, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let result = write_batch(&mut writer, &batch).await;
        // Dropping the frames releases their permits.
        batch.clear();
        if let Err(e) = result {
            tracing::error!("Writer failed: {}", e);
            return Err(e);
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames with vectored I/O, resuming after partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut written = 0;

    while written < total_size {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices covering everything in `batch` past the first `skip` bytes.
fn remaining_slices(batch: &[OutboundFrame], mut skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);

    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            slices.push(IoSlice::new(&part[skip..]));
            skip = 0;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, FrameKind};
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn message(call_id: u32, payload: &'static [u8]) -> OutboundFrame {
        let header = Header::for_kind(1, FrameKind::Message, true, call_id, payload.len() as u32);
        OutboundFrame::new(&header, Bytes::from_static(payload))
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout(), DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[test]
    fn test_remaining_slices() {
        let batch = vec![message(1, b"hello")];

        let all = remaining_slices(&batch, 0);
        assert_eq!(all.len(), 2);

        let partial_header = remaining_slices(&batch, 5);
        assert_eq!(partial_header[0].len(), HEADER_SIZE - 5);
        assert_eq!(partial_header[1].len(), 5);

        let payload_only = remaining_slices(&batch, HEADER_SIZE + 2);
        assert_eq!(payload_only.len(), 1);
        assert_eq!(&payload_only[0][..], b"llo");
    }

    #[test]
    fn test_remaining_slices_skips_empty_payload() {
        let header = Header::for_kind(1, FrameKind::End, true, 1, 0);
        let batch = vec![OutboundFrame::empty(&header), message(1, b"x")];

        let slices = remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 3);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|i| message(i, b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 3));
    }

    #[tokio::test]
    async fn test_frames_arrive_in_send_order() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default());

        for i in 0..10u32 {
            handle.send(message(i, b"data")).await.unwrap();
        }
        drop(handle);
        task.await.unwrap().unwrap();

        let mut bytes = Vec::new();
        server.read_to_end(&mut bytes).await.unwrap();
        let frames = FrameBuffer::new().push(&bytes).unwrap();

        let ids: Vec<u32> = frames.iter().map(|f| f.call_id()).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_backpressure_timeout() {
        // Nobody reads the other end, so the writer stalls once the pipe fills.
        let (client, _server) = duplex(16);
        let config = WriterConfig {
            max_pending_frames: 2,
            channel_capacity: 2,
            backpressure_timeout_ms: 20,
        };
        let (handle, _task) = spawn_writer_task(client, &config);

        let mut result = Ok(());
        for i in 0..8 {
            result = handle.send(message(i, b"payload")).await;
            if result.is_err() {
                break;
            }
        }

        assert!(matches!(result, Err(RpcError::BackpressureTimeout)));
        assert!(handle.is_backpressure_active());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
    }
}
