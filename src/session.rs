//! Voice session manager
//!
//! Owns at most one live session and is the single point of serialization
//! for everything that happens to it. Three independent sources feed it:
//!
//! - the transport (ready, speech segments, interrupts, errors, close)
//! - the output device (segment completion)
//! - the user (start, stop, reset, trigger)
//!
//! Microphone frames do not pass through here; once the session is ready
//! the capture pipeline forwards them straight to the transport.
//!
//! Every mutation takes `&mut self`, so handlers never interleave. Device
//! acquisition and the transport handshake run as a pending future polled
//! alongside everything else, so a stop issued while connecting abandons
//! it and releases whatever was already acquired.

use crate::audio::capture::{CapturePipeline, CaptureStats};
use crate::audio::{
    AudioInput, AudioOutput, InputHandle, InputStream, OutputEvent, OutputHandle,
};
use crate::codec::{self, EncodedFrame};
use crate::config::Config;
use crate::error::{CodecError, TransportError, VoxlineError};
use crate::playback::PlaybackScheduler;
use crate::state::{SessionEvent, SessionState};
use crate::transport::{
    FrameSink, OpenRequest, Transport, TransportChannel, TransportCloser, TransportEvent,
};
use futures_util::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Capacity of the state-change broadcast
const UPDATE_BUFFER: usize = 64;

/// Fixed parameters for every session this manager starts
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub request: OpenRequest,
    pub capture_rate: u32,
    pub playback_rate: u32,
    pub playback_channels: u16,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request: OpenRequest::from_config(&config.transport),
            capture_rate: config.audio.sample_rate,
            playback_rate: config.playback.sample_rate,
            playback_channels: config.playback.channels,
        }
    }
}

/// User intents from the UI surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    /// Leave the error state
    Reset,
    /// Clear the last error message
    DismissError,
    /// Open the surface, optionally starting a session
    Trigger { auto_start: bool },
}

/// Something that happened to the live session
enum SessionInput {
    Connected(Result<Session, VoxlineError>),
    Transport(TransportEvent),
    Output(OutputEvent),
    ConnectTimeout,
}

/// Acquisition and handshake still in flight
struct PendingConnect {
    future: BoxFuture<'static, Result<Session, VoxlineError>>,
    deadline: Instant,
}

/// Microphone that is released when dropped
struct MicGuard(Box<dyn InputStream>);

impl Drop for MicGuard {
    fn drop(&mut self) {
        release_input(self.0.as_mut());
    }
}

/// Resources held by one live session
struct Session {
    input: MicGuard,
    /// Mic windows, handed to the capture pipeline once ready
    windows: Option<mpsc::Receiver<Vec<f32>>>,
    capture: Option<CapturePipeline>,
    sender: Arc<dyn FrameSink>,
    events: mpsc::Receiver<TransportEvent>,
    closer: Box<dyn TransportCloser>,
    scheduler: PlaybackScheduler,
    output_events: mpsc::UnboundedReceiver<OutputEvent>,
    connect_deadline: Instant,
}

/// Client-side owner of the voice session lifecycle
pub struct SessionManager {
    options: SessionOptions,
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
    transport: Arc<dyn Transport>,
    state: SessionState,
    pending: Option<PendingConnect>,
    session: Option<Session>,
    last_error: Option<String>,
    open: bool,
    updates: broadcast::Sender<SessionState>,
}

impl SessionManager {
    pub fn new(
        options: SessionOptions,
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            options,
            input,
            output,
            transport,
            state: SessionState::Idle,
            pending: None,
            session: None,
            last_error: None,
            open: false,
            updates,
        }
    }

    /// Manager wired to the cpal microphone, rodio speaker and live transport
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            SessionOptions::from_config(config),
            crate::audio::create_input(&config.audio),
            crate::audio::create_output(&config.playback),
            crate::transport::create_transport(),
        )
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Human-readable message for the most recent failure
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether the UI surface has been opened by a trigger
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Segments scheduled but not yet finished
    pub fn active_segments(&self) -> usize {
        self.session
            .as_ref()
            .map(|s| s.scheduler.active_len())
            .unwrap_or(0)
    }

    /// Counters of the running capture pipeline, if any
    pub fn capture_stats(&self) -> Option<CaptureStats> {
        self.session
            .as_ref()
            .and_then(|s| s.capture.as_ref())
            .map(|c| c.stats())
    }

    /// Receive every state transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.updates.subscribe()
    }

    /// Begin a session; a no-op unless idle
    ///
    /// Returns once devices are acquired and the transport is open, or the
    /// attempt failed. The session becomes `listening` when the service
    /// reports ready. [`run`](Self::run) does not wait here; it keeps
    /// serving commands while the connect is in flight.
    pub async fn start(&mut self) {
        if !self.begin() {
            return;
        }
        while self.pending.is_some() {
            self.process_next().await;
        }
    }

    /// Enter `connecting` and queue the connect; false unless idle
    fn begin(&mut self) -> bool {
        if !self.state.is_idle() {
            tracing::debug!("Ignoring start while {}", self.state);
            return false;
        }

        self.apply(SessionEvent::Start);
        tracing::info!("Connecting to voice service ({})", self.transport.name());

        let deadline = Instant::now() + self.options.request.connect_timeout;
        let future = connect(
            self.input.clone(),
            self.output.clone(),
            self.transport.clone(),
            self.options.clone(),
            deadline,
        )
        .boxed();
        self.pending = Some(PendingConnect { future, deadline });
        true
    }

    /// End the session; idempotent
    pub fn stop(&mut self) {
        if self.state.is_live() {
            tracing::info!("Stopping session");
            self.end(SessionEvent::Stop);
        } else {
            tracing::debug!("Ignoring stop while {}", self.state);
        }
    }

    /// Leave the error state so `start()` is accepted again
    pub fn reset(&mut self) {
        if self.apply(SessionEvent::Reset) {
            tracing::info!("Session reset");
        } else {
            tracing::debug!("Ignoring reset while {}", self.state);
        }
    }

    pub fn dismiss_error(&mut self) {
        self.last_error = None;
    }

    /// External trigger: open the surface and optionally start
    pub async fn trigger(&mut self, auto_start: bool) {
        self.open = true;
        if auto_start {
            self.start().await;
        }
    }

    /// Apply a command without waiting for a connect to finish
    pub fn handle_command(&mut self, command: Command) {
        tracing::debug!("Command: {:?}", command);
        match command {
            Command::Start => {
                self.begin();
            }
            Command::Stop => self.stop(),
            Command::Reset => self.reset(),
            Command::DismissError => self.dismiss_error(),
            Command::Trigger { auto_start } => {
                self.open = true;
                if auto_start {
                    self.begin();
                }
            }
        }
    }

    /// Wait for and handle the next session event
    ///
    /// The outcome of a pending connect counts as an event. Returns `false`
    /// immediately when nothing is connecting or live.
    pub async fn process_next(&mut self) -> bool {
        match self.next_input().await {
            Some(input) => {
                self.handle_input(input);
                true
            }
            None => false,
        }
    }

    /// Serve commands until the channel closes, then stop
    pub async fn run(&mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(input) = self.next_input() => self.handle_input(input),
            }
        }
        self.stop();
    }

    async fn next_input(&mut self) -> Option<SessionInput> {
        if let Some(pending) = self.pending.as_mut() {
            let input = tokio::select! {
                result = &mut pending.future => SessionInput::Connected(result),
                _ = tokio::time::sleep_until(pending.deadline) => SessionInput::ConnectTimeout,
            };
            return Some(input);
        }

        let connecting = self.state == SessionState::Connecting;
        let session = self.session.as_mut()?;

        let input = tokio::select! {
            event = session.events.recv() => SessionInput::Transport(event.unwrap_or_else(|| {
                TransportEvent::Closed { reason: "event stream ended".into() }
            })),
            Some(event) = session.output_events.recv() => SessionInput::Output(event),
            _ = tokio::time::sleep_until(session.connect_deadline), if connecting => {
                SessionInput::ConnectTimeout
            }
        };
        Some(input)
    }

    fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Connected(result) => {
                self.pending = None;
                match result {
                    Ok(session) => self.session = Some(session),
                    Err(e) => self.fail(e),
                }
            }
            SessionInput::Transport(event) => self.handle_transport_event(event),
            SessionInput::Output(event) => self.handle_output_event(event),
            SessionInput::ConnectTimeout => {
                if self.state == SessionState::Connecting {
                    let secs = self.options.request.connect_timeout.as_secs();
                    self.fail(TransportError::Timeout(secs).into());
                }
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready => self.on_ready(),
            TransportEvent::Segment(frame) => self.on_segment(frame),
            TransportEvent::Text(text) => tracing::info!("Assistant: {}", text),
            TransportEvent::Interrupted => self.on_interrupted(),
            TransportEvent::TurnComplete => tracing::debug!("Assistant turn complete"),
            TransportEvent::Error(e) => self.fail(e.into()),
            TransportEvent::Closed { reason } => self.on_closed(reason),
        }
    }

    fn on_ready(&mut self) {
        if self.state != SessionState::Connecting {
            tracing::debug!("Ignoring ready while {}", self.state);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let Some(windows) = session.windows.take() {
            session.capture = Some(CapturePipeline::spawn(
                windows,
                self.options.capture_rate,
                session.sender.clone(),
            ));
        }

        self.last_error = None;
        self.apply(SessionEvent::Ready);
        tracing::info!("Session ready, listening");
    }

    fn on_segment(&mut self, frame: EncodedFrame) {
        if !self.state.is_active() {
            tracing::debug!("Dropping speech segment received while {}", self.state);
            return;
        }

        let audio = match codec::decode_inbound(
            &frame,
            self.options.playback_channels,
            self.options.playback_rate,
        ) {
            Ok(audio) => audio,
            Err(CodecError::InvalidEncoding(e)) => {
                tracing::warn!("Dropping undecodable speech segment: {}", e);
                return;
            }
            Err(e) => {
                self.fail(e.into());
                return;
            }
        };

        if audio.is_empty() {
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.scheduler.schedule(audio) {
            Ok(_) => {
                self.apply(SessionEvent::SegmentScheduled);
            }
            Err(e) => tracing::warn!("Dropping speech segment: {}", e),
        }
    }

    fn on_interrupted(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.scheduler.flush();
        }
        if self.apply(SessionEvent::Interrupted) {
            tracing::debug!("Barge-in, playback flushed");
        }
    }

    fn on_closed(&mut self, reason: String) {
        match self.state {
            SessionState::Connecting => self.fail(
                TransportError::Dropped(format!("closed before the session was ready ({})", reason))
                    .into(),
            ),
            SessionState::Listening | SessionState::Speaking => {
                tracing::info!("Voice service closed the session: {}", reason);
                self.end(SessionEvent::Closed);
            }
            _ => {}
        }
    }

    fn handle_output_event(&mut self, event: OutputEvent) {
        let id = match event {
            OutputEvent::Finished(id) => id,
            OutputEvent::Failed(id, reason) => {
                tracing::warn!("Segment {} failed during playback: {}", id, reason);
                id
            }
        };

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let drained = session.scheduler.complete(id) && session.scheduler.is_idle();

        if drained && self.state == SessionState::Speaking {
            self.apply(SessionEvent::PlaybackDrained);
        }
    }

    /// Enter `ended`, release everything, settle in `idle`
    fn end(&mut self, event: SessionEvent) {
        if !self.apply(event) {
            return;
        }
        self.teardown();
        self.apply(SessionEvent::TeardownComplete);
    }

    /// Enter `error` with a user-visible message and release everything
    fn fail(&mut self, error: VoxlineError) {
        tracing::error!("Session failed: {}", error);
        self.last_error = Some(error.to_string());
        self.apply(SessionEvent::Failed);
        self.teardown();
    }

    /// Release every session resource; each step runs even if another fails
    fn teardown(&mut self) {
        // Dropping an unfinished connect releases what it acquired so far
        if self.pending.take().is_some() {
            tracing::debug!("Abandoned connect in progress");
        }

        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Some(capture) = session.capture.take() {
            capture.stop();
        }
        drop(session.windows.take());

        release_input(session.input.0.as_mut());

        if let Err(e) = session.closer.close() {
            tracing::warn!("Failed to close transport: {}", e);
        }

        session.scheduler.flush();
        if let Err(e) = session.scheduler.close() {
            tracing::warn!("Failed to release speaker: {}", e);
        }

        tracing::debug!("Session resources released");
    }

    /// Run the transition function; returns whether the state changed
    fn apply(&mut self, event: SessionEvent) -> bool {
        match self.state.next(event) {
            Some(next) => {
                tracing::debug!("Session {} -> {} ({:?})", self.state, next, event);
                self.state = next;
                let _ = self.updates.send(next);
                true
            }
            None => false,
        }
    }
}

/// Acquire everything a session needs
///
/// Partial acquisitions are released on failure and when the future is
/// dropped before it completes.
async fn connect(
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
    transport: Arc<dyn Transport>,
    options: SessionOptions,
    connect_deadline: Instant,
) -> Result<Session, VoxlineError> {
    let InputHandle { stream, windows } = input.acquire_input_stream().await?;
    let mic = MicGuard(stream);

    let OutputHandle {
        sink,
        events: output_events,
    } = output
        .acquire_output_sink(options.playback_rate, options.playback_channels)
        .await?;
    let scheduler = PlaybackScheduler::new(sink);

    let TransportChannel {
        sender,
        events,
        closer,
    } = transport.open(&options.request).await?;

    Ok(Session {
        input: mic,
        windows: Some(windows),
        capture: None,
        sender,
        events,
        closer,
        scheduler,
        output_events,
        connect_deadline,
    })
}

fn release_input(input: &mut dyn InputStream) {
    if let Err(e) = input.release() {
        tracing::warn!("Failed to release microphone: {}", e);
    }
}
