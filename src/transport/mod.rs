//! Transport to the remote voice service
//!
//! A transport opens one bidirectional channel per session. Outbound audio
//! goes through a [`FrameSink`]; everything the service says comes back as
//! an ordered stream of [`TransportEvent`]s.

pub mod live;

use crate::codec::EncodedFrame;
use crate::config::TransportConfig;
use crate::error::TransportError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What the service should respond with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Audio,
    Text,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseModality::Audio => "AUDIO",
            ResponseModality::Text => "TEXT",
        }
    }
}

/// Parameters for opening a session channel
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub endpoint: String,
    pub model: String,
    pub modality: ResponseModality,
    pub voice: String,
    /// Persona prompt, passed through untouched
    pub system_instruction: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
}

impl OpenRequest {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            modality: ResponseModality::Audio,
            voice: config.voice.clone(),
            system_instruction: config.rendered_instruction(),
            api_key: config.api_key.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

/// Everything the remote side can tell us
#[derive(Debug, PartialEq)]
pub enum TransportEvent {
    /// The service accepted the session and will take audio
    Ready,
    /// A chunk of synthesized speech
    Segment(EncodedFrame),
    /// Text emitted alongside or instead of audio
    Text(String),
    /// The user barged in; queued speech must be discarded
    Interrupted,
    /// The model finished its turn
    TurnComplete,
    /// The channel failed
    Error(TransportError),
    /// The remote side closed the channel
    Closed { reason: String },
}

/// Outbound half of a channel
pub trait FrameSink: Send + Sync {
    /// Queue a frame for sending without blocking
    fn send_frame(&self, frame: EncodedFrame) -> Result<(), TransportError>;
}

/// Handle that shuts a channel down
pub trait TransportCloser: Send {
    /// Close the channel. Safe to call more than once.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// An open channel to the voice service
pub struct TransportChannel {
    pub sender: Arc<dyn FrameSink>,
    pub events: mpsc::Receiver<TransportEvent>,
    pub closer: Box<dyn TransportCloser>,
}

/// Something that can open channels to the voice service
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &OpenRequest) -> Result<TransportChannel, TransportError>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Factory function for the configured transport
pub fn create_transport() -> Arc<dyn Transport> {
    Arc::new(live::LiveTransport::new())
}
