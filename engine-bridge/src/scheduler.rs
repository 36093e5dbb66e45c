//! Outgoing write scheduling under transport backpressure.
//!
//! Frames are accepted immediately into a FIFO and flushed by a dedicated
//! writer task. A transport that cannot take more data answers
//! [`SinkStatus::Saturated`]; the writer then parks on [`FrameSink::drain`]
//! and resumes with the same frame, so order is never disturbed and nothing
//! is dropped. Memory is bounded by rejecting new frames once `max_depth`
//! frames are waiting.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::{Bytes, BytesMut};

/// Answer of a transport to an offered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    /// Frame taken; the sink owns delivering it.
    Accepted,
    /// Frame NOT taken; offer it again after [`FrameSink::drain`].
    Saturated,
}

/// Transport contract used by the writer task.
#[async_trait]
pub trait FrameSink: Send {
    fn offer(&mut self, frame: &Bytes) -> std::io::Result<SinkStatus>;

    /// Resolve once everything accepted so far has reached the transport.
    async fn drain(&mut self) -> std::io::Result<()>;
}

/// [`FrameSink`] over any async byte writer (the engine's stdin).
///
/// Accepts frames into a local buffer until `high_water_mark` bytes are held.
pub struct PipeSink<W> {
    writer: W,
    buffer: BytesMut,
    high_water_mark: usize,
}

impl<W> PipeSink<W> {
    pub fn new(writer: W, high_water_mark: usize) -> Self {
        Self {
            writer,
            buffer: BytesMut::new(),
            high_water_mark,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> FrameSink for PipeSink<W> {
    fn offer(&mut self, frame: &Bytes) -> std::io::Result<SinkStatus> {
        // An empty buffer always takes one frame, however large.
        if !self.buffer.is_empty() && self.buffer.len() + frame.len() > self.high_water_mark {
            return Ok(SinkStatus::Saturated);
        }
        self.buffer.extend_from_slice(frame);
        Ok(SinkStatus::Accepted)
    }

    async fn drain(&mut self) -> std::io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split();
        self.writer.write_all(&chunk).await?;
        self.writer.flush().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("write queue saturated ({depth} frames pending)")]
    Saturated { depth: usize },
    #[error("writer task has stopped")]
    Closed,
}

/// Handle to one writer task. Dropping it lets the task flush and exit.
pub struct WriteScheduler {
    tx: mpsc::UnboundedSender<Bytes>,
    depth: Arc<AtomicUsize>,
    max_depth: Option<usize>,
    task: JoinHandle<()>,
}

impl WriteScheduler {
    pub fn spawn<S: FrameSink + 'static>(sink: S, max_depth: Option<usize>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(run_writer(sink, rx, Arc::clone(&depth)));
        Self {
            tx,
            depth,
            max_depth,
            task,
        }
    }

    /// Queue `frame` behind everything enqueued before it.
    pub fn enqueue(&self, frame: Bytes) -> Result<(), ScheduleError> {
        let depth = self.depth.load(Ordering::Acquire);
        if let Some(max) = self.max_depth
            && depth >= max
        {
            return Err(ScheduleError::Saturated { depth });
        }

        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(frame).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(ScheduleError::Closed);
        }
        Ok(())
    }

    /// Frames accepted here but not yet taken by the transport.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop accepting frames; queued frames are still flushed.
    pub fn close(self) -> JoinHandle<()> {
        drop(self.tx);
        self.task
    }
}

async fn run_writer<S: FrameSink>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    depth: Arc<AtomicUsize>,
) {
    let mut queue: VecDeque<Bytes> = VecDeque::new();

    loop {
        if queue.is_empty() {
            match rx.recv().await {
                Some(frame) => queue.push_back(frame),
                None => break,
            }
        }
        while let Ok(frame) = rx.try_recv() {
            queue.push_back(frame);
        }

        while let Some(frame) = queue.front() {
            match sink.offer(frame) {
                Ok(SinkStatus::Accepted) => {
                    queue.pop_front();
                    depth.fetch_sub(1, Ordering::AcqRel);
                }
                Ok(SinkStatus::Saturated) => {
                    tracing::trace!(queued = queue.len(), "Transport saturated, waiting for drain");
                    if let Err(e) = sink.drain().await {
                        tracing::warn!(error = %e, dropped = queue.len(), "Transport write failed");
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, dropped = queue.len(), "Transport rejected frame");
                    return;
                }
            }
        }

        if let Err(e) = sink.drain().await {
            tracing::warn!(error = %e, "Transport write failed");
            return;
        }
    }

    tracing::debug!("Writer task exiting");
}
