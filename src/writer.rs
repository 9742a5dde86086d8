//! Dedicated writer task per stream.
//!
//! Every record written to a front-facing or backend stream goes through
//! that stream's single writer task, fed by an mpsc channel. Concurrent
//! producers therefore never interleave partial records on the wire, and
//! ready frames are batched into vectored writes.
//!
//! # Architecture
//!
//! ```text
//! Bridge ─────┐
//! Relay 1 ────┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Stream
//! Relay N ────┘
//! ```
//!
//! Dropping every [`WriterHandle`] flushes the queue and shuts the stream's
//! write side down.

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::{BackpressureController, DEFAULT_MAX_PENDING, DEFAULT_TIMEOUT};
use crate::error::{BridgeError, Result};
use crate::protocol::{padding_for, Frame, Record, HEADER_SIZE, PADDING};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Records gathered into one vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// A record ready for the socket, header already encoded.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Pre-encoded header (8 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Content bytes (empty for end-markers and aborts).
    pub content: Bytes,
    /// Zero bytes appended after the content.
    pub padding: u8,
}

impl OutboundFrame {
    pub fn new(frame: &Frame) -> Self {
        let mut header = frame.header;
        // padding beyond 7 bytes is only ever accepted inbound
        if header.padding_length as usize > PADDING.len() {
            header.padding_length = padding_for(frame.content.len());
        }
        Self {
            header: header.encode(),
            content: frame.content.clone(),
            padding: header.padding_length,
        }
    }

    /// Total size of this frame (header + content + padding).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.content.len() + self.padding as usize
    }

    #[inline]
    fn padding_bytes(&self) -> &[u8] {
        &PADDING[..self.padding as usize]
    }

    fn slices(&self) -> [&[u8]; 3] {
        [&self.header, &self.content, self.padding_bytes()]
    }
}

impl From<Frame> for OutboundFrame {
    fn from(frame: Frame) -> Self {
        Self::new(&frame)
    }
}

/// Queue limits for one writer task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Records queued before producers start waiting.
    pub max_pending_frames: usize,
    /// Capacity of the channel feeding the task.
    pub channel_capacity: usize,
    /// How long a producer waits for a slot (milliseconds in JSON).
    #[serde(with = "crate::config::duration_ms")]
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Producer side of a writer task. Clones feed the same socket.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundFrame>, backpressure: BackpressureController) -> Self {
        Self { tx, backpressure }
    }

    /// Queue a record, waiting while the queue is full.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.backpressure.reserve().await?;

        self.tx.send(frame).await.map_err(|_| {
            self.backpressure.release();
            BridgeError::ConnectionClosed
        })
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.send(OutboundFrame::from(frame)).await
    }

    pub async fn send_record(&self, record: Record) -> Result<()> {
        self.send_frame(record.into_frame()).await
    }

}

/// Start the writer task for `writer`.
///
/// The join handle resolves once every handle is dropped and the queue is
/// flushed, or with the first write error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let backpressure =
        BackpressureController::with_timeout(config.max_pending_frames, config.backpressure_timeout);

    let handle = WriterHandle::new(tx, backpressure.clone());
    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, backpressure.clone()).await;
        if let Err(e) = &result {
            tracing::debug!("Writer task stopped: {}", e);
            backpressure.close();
        }
        result
    });

    (handle, task)
}

/// Drain the channel in batches until every handle is gone.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backpressure: BackpressureController,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                // every handle dropped
                writer.shutdown().await?;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;
        backpressure.release_many(batch_size);
    }
}

/// Push a batch out with `write_vectored`, resuming after short writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering everything after the first `skip_bytes` of the batch.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 3);
    let mut offset = 0;

    for frame in batch {
        for part in frame.slices() {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start_in_part = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start_in_part..]));
            }
            offset = end;
        }
    }

    slices
}
