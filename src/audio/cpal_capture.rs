//! cpal-based microphone input
//!
//! Uses the cpal crate for cross-platform audio input.
//! Works with PipeWire, PulseAudio, and ALSA backends.
//!
//! Note: cpal::Stream is not Send, so the stream lives on a dedicated
//! thread and we communicate with it via channels.

use super::capture::Framer;
use super::{join_device_thread, AudioInput, InputHandle, InputStream};
use crate::config::AudioConfig;
use crate::error::DeviceError;
use std::thread;
use tokio::sync::{mpsc, oneshot};

/// Windows buffered between the device callback and the pipeline.
/// One window ahead at most; anything beyond that is dropped.
const WINDOW_BUFFER: usize = 1;

/// Parameters for building an audio input stream
struct StreamBuildParams {
    tx: mpsc::Sender<Vec<f32>>,
    framer: Framer,
    source_rate: u32,
    target_rate: u32,
    source_channels: usize,
}

/// cpal microphone source
pub struct CpalInput {
    config: AudioConfig,
}

impl CpalInput {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

/// Handle to the capture thread; releasing it drops the cpal stream
pub struct CpalInputStream {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl InputStream for CpalInputStream {
    fn release(&mut self) -> Result<(), DeviceError> {
        let Some(stop_tx) = self.stop_tx.take() else {
            return Ok(());
        };

        // The thread also exits if the sender is simply dropped
        let _ = stop_tx.send(());

        if let Some(handle) = self.thread_handle.take() {
            join_device_thread("capture", handle)
                .map_err(|_| DeviceError::StreamError("capture thread panicked".into()))?;
        }

        tracing::debug!("Microphone released");
        Ok(())
    }

    fn is_released(&self) -> bool {
        self.stop_tx.is_none()
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Failed to release microphone: {}", e);
        }
    }
}

/// Map a cpal error description onto our taxonomy
///
/// Backends report permission problems only as text, so look for the
/// usual wording.
fn classify_device_error(description: &str) -> DeviceError {
    let lower = description.to_lowercase();
    if lower.contains("permission")
        || lower.contains("denied")
        || lower.contains("not permitted")
        || lower.contains("not authorized")
    {
        DeviceError::PermissionDenied(description.to_string())
    } else if lower.contains("busy") || lower.contains("not available") {
        DeviceError::Unavailable(description.to_string())
    } else {
        DeviceError::StreamError(description.to_string())
    }
}

fn from_build_error(e: cpal::BuildStreamError) -> DeviceError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            DeviceError::Unavailable("the input device is no longer available".into())
        }
        cpal::BuildStreamError::BackendSpecific { err } => classify_device_error(&err.description),
        other => DeviceError::StreamError(other.to_string()),
    }
}

fn from_play_error(e: cpal::PlayStreamError) -> DeviceError {
    match e {
        cpal::PlayStreamError::DeviceNotAvailable => {
            DeviceError::Unavailable("the input device is no longer available".into())
        }
        cpal::PlayStreamError::BackendSpecific { err } => classify_device_error(&err.description),
    }
}

/// Find an audio input device by name with flexible matching.
///
/// Matching strategy (in order):
/// 1. Exact match (case-sensitive)
/// 2. Exact match (case-insensitive)
/// 3. Substring match: device name contains the search term (case-insensitive)
fn find_audio_device(host: &cpal::Host, device_name: &str) -> Result<cpal::Device, DeviceError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let devices: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?
        .filter_map(|d| d.name().ok().map(|name| (name, d)))
        .collect();

    let names: Vec<&str> = devices.iter().map(|(name, _)| name.as_str()).collect();
    let index = match_device_name(&names, device_name)
        .ok_or_else(|| DeviceError::NotFound(device_name.to_string()))?;

    let (name, device) = devices
        .into_iter()
        .nth(index)
        .ok_or_else(|| DeviceError::NotFound(device_name.to_string()))?;
    tracing::debug!("Found audio device: {} (searched for: {})", name, device_name);
    Ok(device)
}

/// Index of the best match for `wanted` in `names`
fn match_device_name(names: &[&str], wanted: &str) -> Option<usize> {
    let wanted_lower = wanted.to_lowercase();
    names
        .iter()
        .position(|n| *n == wanted)
        .or_else(|| names.iter().position(|n| n.to_lowercase() == wanted_lower))
        .or_else(|| {
            names
                .iter()
                .position(|n| n.to_lowercase().contains(&wanted_lower))
        })
}

/// Resolve the configured device and its default input config
///
/// Kept synchronous so no host handle is held across an await.
fn open_device(
    config: &AudioConfig,
) -> Result<(cpal::Device, cpal::SupportedStreamConfig), DeviceError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();

    let device = if config.device == "default" {
        host.default_input_device()
            .ok_or_else(|| DeviceError::NotFound("default".to_string()))?
    } else {
        find_audio_device(&host, &config.device)?
    };

    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
    tracing::info!("Using audio device: {}", device_name);

    let supported_config = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            DeviceError::Unavailable(device_name.clone())
        }
        cpal::DefaultStreamConfigError::BackendSpecific { err } => {
            classify_device_error(&err.description)
        }
        other => DeviceError::StreamError(other.to_string()),
    })?;

    Ok((device, supported_config))
}

#[async_trait::async_trait]
impl AudioInput for CpalInput {
    async fn acquire_input_stream(&self) -> Result<InputHandle, DeviceError> {
        use cpal::traits::StreamTrait;

        let (device, supported_config) = open_device(&self.config)?;

        let source_sample_rate = supported_config.sample_rate().0;
        let source_channels = supported_config.channels() as usize;
        let target_sample_rate = self.config.sample_rate;
        let sample_format = supported_config.sample_format();
        let window_size = self.config.window_size;

        tracing::debug!(
            "Device config: {} Hz, {} channel(s), format: {:?}",
            source_sample_rate,
            source_channels,
            sample_format
        );

        let (window_tx, window_rx) = mpsc::channel(WINDOW_BUFFER);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), DeviceError>>();

        let thread_handle = thread::spawn(move || {
            let stream_config = cpal::StreamConfig {
                channels: supported_config.channels(),
                sample_rate: supported_config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };

            let err_fn = |err| tracing::error!("Audio stream error: {}", err);

            let params = StreamBuildParams {
                tx: window_tx,
                framer: Framer::new(window_size),
                source_rate: source_sample_rate,
                target_rate: target_sample_rate,
                source_channels,
            };

            let stream_result = match sample_format {
                cpal::SampleFormat::F32 => {
                    build_stream::<f32>(&device, &stream_config, params, err_fn)
                }
                cpal::SampleFormat::I16 => {
                    build_stream::<i16>(&device, &stream_config, params, err_fn)
                }
                cpal::SampleFormat::U16 => {
                    build_stream::<u16>(&device, &stream_config, params, err_fn)
                }
                format => Err(DeviceError::StreamError(format!(
                    "Unsupported sample format: {:?}",
                    format
                ))),
            };

            let stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(from_play_error(e)));
                return;
            }

            tracing::debug!("Audio capture thread started");
            let _ = ready_tx.send(Ok(()));

            // Block until released (or the handle is dropped)
            let _ = stop_rx.recv();
            drop(stream);

            tracing::debug!("Audio capture thread stopped");
        });

        let mut stream = CpalInputStream {
            stop_tx: Some(stop_tx),
            thread_handle: Some(thread_handle),
        };

        match ready_rx.await {
            Ok(Ok(())) => Ok(InputHandle {
                stream: Box::new(stream),
                windows: window_rx,
            }),
            Ok(Err(e)) => {
                let _ = stream.release();
                Err(e)
            }
            Err(_) => {
                let _ = stream.release();
                Err(DeviceError::StreamError(
                    "capture thread exited before starting".into(),
                ))
            }
        }
    }
}

/// Build an input stream for a specific sample type
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    params: StreamBuildParams,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, DeviceError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    use cpal::traits::DeviceTrait;

    let StreamBuildParams {
        tx,
        mut framer,
        source_rate,
        target_rate,
        source_channels,
    } = params;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Convert to f32 and mix to mono
                let mono_f32: Vec<f32> = data
                    .chunks(source_channels)
                    .map(|frame| {
                        let sum: f32 = frame
                            .iter()
                            .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                            .sum();
                        sum / source_channels as f32
                    })
                    .collect();

                let resampled = if source_rate != target_rate {
                    resample(&mono_f32, source_rate, target_rate)
                } else {
                    mono_f32
                };

                for window in framer.push(&resampled) {
                    if tx.try_send(window).is_err() {
                        tracing::trace!("Capture consumer behind, dropping window");
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(from_build_error)?;

    Ok(stream)
}

/// Linear interpolation resampling
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples.get(idx).copied().unwrap_or(0.0)
        };

        output.push(sample);
    }

    output
}
