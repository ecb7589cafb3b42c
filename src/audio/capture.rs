//! Capture pipeline: microphone windows to outbound frames
//!
//! The device pushes fixed-size windows; each one is encoded and handed to
//! the transport immediately. A frame that cannot be sent is dropped, since
//! live audio cannot queue indefinitely.

use crate::codec;
use crate::transport::FrameSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Splits an arbitrary stream of samples into fixed-size windows
#[derive(Debug)]
pub struct Framer {
    window_size: usize,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            pending: Vec::with_capacity(window_size),
        }
    }

    /// Add samples and return every window that is now complete
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut windows = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let take = (self.window_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.window_size {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.window_size));
                windows.push(full);
            }
        }

        windows
    }

    /// Samples waiting for the next window
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Counters for a running pipeline
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub sent: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Running capture pipeline
///
/// Frames leave in capture order. Dropping or stopping the pipeline ends
/// the frame sequence; it cannot be restarted.
pub struct CapturePipeline {
    task: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl CapturePipeline {
    /// Start forwarding `windows` to `sink`, encoded at `sample_rate`
    pub fn spawn(
        mut windows: mpsc::Receiver<Vec<f32>>,
        sample_rate: u32,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let task_counters = counters.clone();

        let task = tokio::spawn(async move {
            let mut sequence: u64 = 0;
            while let Some(window) = windows.recv().await {
                sequence += 1;
                let frame = codec::encode_outbound(&window, sample_rate);
                match sink.send_frame(frame) {
                    Ok(()) => {
                        task_counters.sent.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!("Sent capture frame #{}", sequence);
                    }
                    Err(e) => {
                        task_counters.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Dropped capture frame #{}: {}", sequence, e);
                    }
                }
            }
            tracing::debug!("Capture stream ended after {} frames", sequence);
        });

        Self { task, counters }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop forwarding immediately, discarding any window not yet sent
    pub fn stop(self) -> CaptureStats {
        self.task.abort();
        let stats = self.stats();
        tracing::debug!(
            "Capture stopped: {} frames sent, {} dropped",
            stats.sent,
            stats.dropped
        );
        stats
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.task.abort();
    }
}
