//! rodio-based speech output
//!
//! Each segment gets its own rodio `Sink`, delayed so it begins at its
//! scheduled offset. The output stream is not Send, so like the capture
//! side it lives on a dedicated thread driven by commands. That thread
//! polls its sinks and reports each one that drains as finished.

use super::{join_device_thread, AudioOutput, OutputEvent, OutputHandle, OutputSink};
use crate::codec::AudioFrame;
use crate::config::PlaybackConfig;
use crate::error::DeviceError;
use crate::playback::SegmentId;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink, Source};
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// How often the output thread checks for drained sinks
const POLL_INTERVAL: Duration = Duration::from_millis(10);

enum PlaybackCommand {
    Play {
        id: SegmentId,
        samples: Vec<f32>,
        delay: Duration,
    },
    Stop(SegmentId),
    Shutdown,
}

/// rodio speaker
pub struct RodioOutput {
    volume: f32,
}

impl RodioOutput {
    pub fn new(config: &PlaybackConfig) -> Self {
        Self {
            volume: config.volume,
        }
    }
}

/// Sink handle backed by the output thread
pub struct RodioSink {
    cmd_tx: Option<Sender<PlaybackCommand>>,
    thread_handle: Option<thread::JoinHandle<()>>,
    origin: Instant,
    sample_rate: u32,
    channels: u16,
}

impl OutputSink for RodioSink {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start(&mut self, id: SegmentId, frame: AudioFrame, at: f64) -> Result<(), DeviceError> {
        if frame.sample_rate() != self.sample_rate || frame.channels() != self.channels {
            return Err(DeviceError::Playback(format!(
                "segment is {} Hz/{}ch, sink is {} Hz/{}ch",
                frame.sample_rate(),
                frame.channels(),
                self.sample_rate,
                self.channels
            )));
        }

        let cmd_tx = self
            .cmd_tx
            .as_ref()
            .ok_or_else(|| DeviceError::Playback("output is closed".into()))?;

        let delay = Duration::from_secs_f64((at - self.now()).max(0.0));
        cmd_tx
            .send(PlaybackCommand::Play {
                id,
                samples: frame.to_f32(),
                delay,
            })
            .map_err(|_| DeviceError::Playback("output thread has stopped".into()))
    }

    fn stop(&mut self, id: SegmentId) {
        if let Some(ref cmd_tx) = self.cmd_tx {
            let _ = cmd_tx.send(PlaybackCommand::Stop(id));
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let Some(cmd_tx) = self.cmd_tx.take() else {
            return Ok(());
        };
        let _ = cmd_tx.send(PlaybackCommand::Shutdown);

        if let Some(handle) = self.thread_handle.take() {
            join_device_thread("output", handle)
                .map_err(|_| DeviceError::Playback("output thread panicked".into()))?;
        }

        tracing::debug!("Speaker released");
        Ok(())
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to release speaker: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl AudioOutput for RodioOutput {
    async fn acquire_output_sink(
        &self,
        sample_rate: u32,
        channels: u16,
    ) -> Result<OutputHandle, DeviceError> {
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<PlaybackCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), DeviceError>>();
        let volume = self.volume;

        let thread_handle = thread::spawn(move || {
            let (_stream, stream_handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = ready_tx.send(Err(DeviceError::Unavailable(format!(
                        "Failed to open audio output: {}",
                        e
                    ))));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            tracing::debug!("Audio output thread started");

            run_output_loop(
                cmd_rx,
                event_tx,
                |samples, delay| {
                    let sink = Sink::try_new(&stream_handle).map_err(|e| e.to_string())?;
                    sink.set_volume(volume);
                    sink.append(SamplesBuffer::new(channels, sample_rate, samples).delay(delay));
                    Ok(sink)
                },
            );

            tracing::debug!("Audio output thread stopped");
        });

        let origin = Instant::now();
        let mut sink = RodioSink {
            cmd_tx: Some(cmd_tx),
            thread_handle: Some(thread_handle),
            origin,
            sample_rate,
            channels,
        };

        match ready_rx.await {
            Ok(Ok(())) => Ok(OutputHandle {
                sink: Box::new(sink),
                events: event_rx,
            }),
            Ok(Err(e)) => {
                let _ = sink.close();
                Err(e)
            }
            Err(_) => {
                let _ = sink.close();
                Err(DeviceError::Unavailable(
                    "output thread exited before starting".into(),
                ))
            }
        }
    }
}

/// Segment player abstraction so the loop can be tested without a device
trait Playing {
    fn stop(&self);
    fn empty(&self) -> bool;
}

impl Playing for Sink {
    fn stop(&self) {
        Sink::stop(self)
    }

    fn empty(&self) -> bool {
        Sink::empty(self)
    }
}

/// Serve commands until shutdown, reporting drained segments
fn run_output_loop<P, F>(
    cmd_rx: Receiver<PlaybackCommand>,
    event_tx: mpsc::UnboundedSender<OutputEvent>,
    mut play: F,
) where
    P: Playing,
    F: FnMut(Vec<f32>, Duration) -> Result<P, String>,
{
    let mut playing: HashMap<SegmentId, P> = HashMap::new();

    loop {
        match cmd_rx.recv_timeout(POLL_INTERVAL) {
            Ok(PlaybackCommand::Play { id, samples, delay }) => match play(samples, delay) {
                Ok(player) => {
                    playing.insert(id, player);
                }
                Err(e) => {
                    tracing::warn!("Failed to play segment {}: {}", id, e);
                    let _ = event_tx.send(OutputEvent::Failed(id, e));
                }
            },
            Ok(PlaybackCommand::Stop(id)) => {
                if let Some(player) = playing.remove(&id) {
                    player.stop();
                }
            }
            Ok(PlaybackCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let drained: Vec<SegmentId> = playing
            .iter()
            .filter(|(_, player)| player.empty())
            .map(|(id, _)| *id)
            .collect();
        for id in drained {
            playing.remove(&id);
            let _ = event_tx.send(OutputEvent::Finished(id));
        }
    }

    for (_, player) in playing.drain() {
        player.stop();
    }
}
