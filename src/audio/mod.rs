//! Audio device module
//!
//! Microphone capture uses cpal, which works with PipeWire, PulseAudio,
//! and ALSA backends. Speech playback uses rodio on top of the same host.
//!
//! The session core only sees the traits below, so tests and alternate
//! hosts can provide their own devices.

pub mod capture;
pub mod cpal_capture;
pub mod rodio_output;

use crate::codec::AudioFrame;
use crate::config::{AudioConfig, PlaybackConfig};
use crate::error::DeviceError;
use crate::playback::SegmentId;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;

/// A live microphone stream
///
/// `windows` yields fixed-size windows of f32 samples (mono, capture rate).
/// The stream keeps the device open until `release` is called.
pub struct InputHandle {
    pub stream: Box<dyn InputStream>,
    pub windows: mpsc::Receiver<Vec<f32>>,
}

/// Ownership of an open input device
pub trait InputStream: Send {
    /// Close the device. Safe to call more than once.
    fn release(&mut self) -> Result<(), DeviceError>;

    /// Whether the device has been released
    fn is_released(&self) -> bool;
}

/// Source of microphone streams
#[async_trait::async_trait]
pub trait AudioInput: Send + Sync {
    /// Open the microphone. Permission problems surface as
    /// [`DeviceError::PermissionDenied`].
    async fn acquire_input_stream(&self) -> Result<InputHandle, DeviceError>;
}

/// Notifications from the output device
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// A segment played to the end
    Finished(SegmentId),
    /// A segment could not be played
    Failed(SegmentId, String),
}

/// An open speaker plus its completion notifications
pub struct OutputHandle {
    pub sink: Box<dyn OutputSink>,
    pub events: mpsc::UnboundedReceiver<OutputEvent>,
}

/// Timeline-based output device
///
/// Times are seconds on the sink's own monotonic output clock.
pub trait OutputSink: Send {
    /// Current position of the output clock
    fn now(&self) -> f64;

    /// Schedule `frame` to begin at `at` on the output clock
    fn start(&mut self, id: SegmentId, frame: AudioFrame, at: f64) -> Result<(), DeviceError>;

    /// Stop a scheduled or playing segment immediately
    fn stop(&mut self, id: SegmentId);

    /// Release the device. Safe to call more than once.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Source of output sinks
#[async_trait::async_trait]
pub trait AudioOutput: Send + Sync {
    async fn acquire_output_sink(
        &self,
        sample_rate: u32,
        channels: u16,
    ) -> Result<OutputHandle, DeviceError>;
}

/// Factory function to create the microphone source
pub fn create_input(config: &AudioConfig) -> Arc<dyn AudioInput> {
    Arc::new(cpal_capture::CpalInput::new(config))
}

/// Factory function to create the speaker
pub fn create_output(config: &PlaybackConfig) -> Arc<dyn AudioOutput> {
    Arc::new(rodio_output::RodioOutput::new(config))
}

/// Wait for a device thread to exit without stalling the async runtime
///
/// On a tokio runtime the join moves to the blocking pool and a panic in
/// the thread is only logged. Without a runtime it joins inline.
pub(crate) fn join_device_thread(
    name: &'static str,
    handle: thread::JoinHandle<()>,
) -> thread::Result<()> {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(move || {
                if handle.join().is_err() {
                    tracing::error!("{} thread panicked", name);
                }
            });
            Ok(())
        }
        Err(_) => handle.join(),
    }
}
