//! Capture pipeline
//!
//! The device callback copies samples into a bounded channel; a worker
//! thread frames fixed-size blocks at the wire rate, encodes them and hands
//! them to a [`FrameSink`]. Nothing is buffered while the sink is
//! disconnected.

use super::{CaptureError, InputDevice, StreamResampler};
use crate::codec::encode_outbound;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How often the worker rechecks the stop flag while idle
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where encoded blocks go
pub trait FrameSink: Send + Sync {
    /// Whether blocks would reach the service right now
    fn is_connected(&self) -> bool;

    /// Fire-and-forget send of one encoded block
    fn send_audio(&self, data: String);
}

/// Counters for the capture worker
#[derive(Debug, Default)]
pub struct CaptureStats {
    blocks_sent: AtomicU64,
    chunks_dropped: AtomicU64,
}

impl CaptureStats {
    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent.load(Ordering::Relaxed)
    }

    /// Device chunks discarded because the connection was down
    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }
}

/// Callback side of the capture channel
///
/// Buffers handed to the worker come back through a spare channel, so once
/// warmed up the device callback fills recycled buffers instead of
/// allocating.
#[derive(Clone)]
pub struct ChunkSender {
    chunks: Sender<Vec<f32>>,
    spare: Receiver<Vec<f32>>,
}

impl ChunkSender {
    /// Fill a recycled buffer and queue it without blocking.
    /// A full queue hands the buffer back in the error.
    pub fn try_fill(&self, fill: impl FnOnce(&mut Vec<f32>)) -> Result<(), TrySendError<Vec<f32>>> {
        let mut buf = self.spare.try_recv().unwrap_or_default();
        buf.clear();
        fill(&mut buf);
        self.chunks.try_send(buf)
    }

    /// Queue an owned chunk, waiting for room. For devices not driven by a
    /// realtime callback.
    pub fn send(&self, samples: Vec<f32>) -> bool {
        self.chunks.send(samples).is_ok()
    }
}

struct ChunkReceiver {
    chunks: Receiver<Vec<f32>>,
    spare: Sender<Vec<f32>>,
}

impl ChunkReceiver {
    fn recycle(&self, buf: Vec<f32>) {
        let _ = self.spare.try_send(buf);
    }
}

fn chunk_channel(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    let (chunks_tx, chunks_rx) = bounded(capacity);
    let (spare_tx, spare_rx) = bounded(capacity);
    (
        ChunkSender {
            chunks: chunks_tx,
            spare: spare_rx,
        },
        ChunkReceiver {
            chunks: chunks_rx,
            spare: spare_tx,
        },
    )
}

/// Collects samples into fixed-size blocks
#[derive(Debug)]
pub struct BlockFramer {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockFramer {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
        }
    }

    /// Append samples, returning every block completed by them
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut blocks = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let take = (self.block_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.block_size {
                let block = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_size));
                blocks.push(block);
            }
        }
        blocks
    }

    /// Forget any partial block
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

pub struct CapturePipeline;

impl CapturePipeline {
    /// Acquire the input device and start forwarding blocks to `sink`.
    ///
    /// Fails with [`CaptureError`] if the device cannot be acquired; this is
    /// never retried here.
    pub fn start(
        mut device: Box<dyn InputDevice>,
        wire_rate: u32,
        block_size: usize,
        queue_capacity: usize,
        sink: Arc<dyn FrameSink>,
    ) -> Result<CaptureHandle, CaptureError> {
        let (chunk_tx, chunk_rx) = chunk_channel(queue_capacity);
        let device_rate = device.open(wire_rate, chunk_tx)?;

        let resampler = if device_rate != wire_rate {
            info!("Capturing at {}Hz, resampling to {}Hz", device_rate, wire_rate);
            match StreamResampler::new(device_rate, wire_rate) {
                Ok(resampler) => Some(resampler),
                Err(e) => {
                    device.close();
                    return Err(CaptureError::Processing(e.to_string()));
                }
            }
        } else {
            None
        };

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(CaptureStats::default());
        let worker = CaptureWorker {
            chunk_rx,
            framer: BlockFramer::new(block_size),
            resampler,
            sink,
            running: Arc::clone(&running),
            stats: Arc::clone(&stats),
        };

        let worker = match thread::Builder::new()
            .name("voicelink-capture".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                device.close();
                return Err(CaptureError::Processing(format!(
                    "Failed to spawn capture worker: {}",
                    e
                )));
            }
        };

        info!("Capture started: {} frames per block", block_size);
        Ok(CaptureHandle {
            device: Some(device),
            worker: Some(worker),
            running,
            stats,
        })
    }
}

/// Running capture; stopping is idempotent and also happens on drop
pub struct CaptureHandle {
    device: Option<Box<dyn InputDevice>>,
    worker: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
}

impl CaptureHandle {
    /// Release the device and unhook the worker
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(mut device) = self.device.take() {
            device.close();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Capture worker panicked");
            }
            info!(
                "Capture stopped ({} blocks sent, {} chunks dropped)",
                self.stats.blocks_sent(),
                self.stats.chunks_dropped()
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureWorker {
    chunk_rx: ChunkReceiver,
    framer: BlockFramer,
    resampler: Option<StreamResampler>,
    sink: Arc<dyn FrameSink>,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
}

impl CaptureWorker {
    fn run(mut self) {
        debug!("Capture worker running");

        while self.running.load(Ordering::SeqCst) {
            match self.chunk_rx.chunks.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => {
                    if self.running.load(Ordering::SeqCst) {
                        self.handle_chunk(&chunk);
                    }
                    self.chunk_rx.recycle(chunk);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                // The device dropped its sender
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!("Capture worker exiting");
    }

    fn handle_chunk(&mut self, chunk: &[f32]) {
        if !self.sink.is_connected() {
            // Drop, never queue: stale audio must not be sent after reconnecting
            self.framer.clear();
            if let Some(resampler) = self.resampler.as_mut() {
                resampler.reset();
            }
            self.stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let resampled;
        let samples = match self.resampler.as_mut() {
            Some(resampler) => match resampler.process(chunk) {
                Ok(out) => {
                    resampled = out;
                    &resampled[..]
                }
                Err(e) => {
                    warn!("Dropping captured chunk: {}", e);
                    return;
                }
            },
            None => chunk,
        };

        for block in self.framer.push(samples) {
            self.sink.send_audio(encode_outbound(&block));
            self.stats.blocks_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}
