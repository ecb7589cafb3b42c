//! Voxline: real-time voice conversations with a hosted assistant
//!
//! This library provides the core functionality for:
//! - Capturing microphone audio via cpal (supports PipeWire, PulseAudio, ALSA)
//! - Encoding it as 16-bit PCM and streaming it over a WebSocket
//! - Scheduling synthesized speech for gapless playback via rodio
//! - Stopping playback instantly when the user talks over the assistant
//! - Tracking the session lifecycle and releasing devices on every exit path
//!
//! # Architecture
//!
//! ```text
//!                   ┌─────────────────────────────────────┐
//!                   │   Daemon (signals, state file)      │
//!                   └─────────────────────────────────────┘
//!                                    │ commands
//!                                    ▼
//!                   ┌─────────────────────────────────────┐
//!                   │   SessionManager (state machine)    │
//!                   └─────────────────────────────────────┘
//!            acquire │                 │ open             │ acquire
//!                    ▼                 ▼                  ▼
//!          ┌──────────────┐   ┌──────────────────┐   ┌──────────────┐
//!          │  Microphone  │   │    Transport     │   │   Speaker    │
//!          │    (cpal)    │   │ (tokio-tungsten.)│   │   (rodio)    │
//!          └──────────────┘   └──────────────────┘   └──────────────┘
//!                 │ windows         ▲        │ segments,      ▲
//!                 ▼                 │        │ interrupts     │
//!          ┌──────────────┐  frames │        ▼                │
//!          │   Capture    │─────────┘  ┌──────────────┐       │
//!          │   Pipeline   │            │   Playback   │───────┘
//!          │   (codec)    │            │  Scheduler   │
//!          └──────────────┘            └──────────────┘
//! ```

pub mod audio;
pub mod cli;
pub mod codec;
pub mod config;
pub mod daemon;
pub mod error;
pub mod playback;
pub mod session;
pub mod state;
pub mod transport;

pub use cli::{Cli, Commands, SessionAction};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{Result, VoxlineError};
pub use session::{Command, SessionManager, SessionOptions};
pub use state::SessionState;
