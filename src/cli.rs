// Command-line interface definitions for voxline
//
// Kept separate from main.rs so the library can expose the argument types.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "voxline")]
#[command(author, version, about = "Real-time voice conversations with a hosted assistant")]
#[command(long_about = "
Voxline streams your microphone to a hosted voice model and plays its
spoken replies back as they arrive. Talking over the assistant interrupts it.

SETUP:
  1. Export your API key: export VOXLINE_API_KEY=...
  2. Run: voxline (to start the daemon)
  3. Bind a key to: voxline session toggle

USAGE:
  voxline session start    Begin a conversation
  voxline session stop     End it and release the microphone
  voxline status --follow  Watch the session state (for Waybar)
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Override microphone device
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Override the prebuilt voice (e.g., Aoede, Kore, Puck)
    #[arg(long, value_name = "VOICE")]
    pub voice: Option<String>,

    /// Override the model identifier
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Set a persona variable, e.g. --var user_name=Ada
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as daemon (default if no command specified)
    Daemon {
        /// Start a session as soon as the daemon is up
        #[arg(long)]
        auto_start: bool,
    },

    /// Control the session from external sources (keybindings, scripts)
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Show daemon status (for Waybar/polybar integration)
    Status {
        /// Continuously output status changes
        #[arg(long)]
        follow: bool,

        /// Output format: "text" (default) or "json" (for Waybar)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show current configuration
    Config,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Start a session (send SIGUSR1 to daemon)
    Start,
    /// Stop the session (send SIGUSR2 to daemon)
    Stop,
    /// Start if idle, otherwise stop
    Toggle,
    /// Clear an error so a new session can start (send SIGHUP to daemon)
    Reset,
}

/// Split a `NAME=VALUE` persona variable
pub fn parse_variable(raw: &str) -> Option<(String, String)> {
    let (name, value) = raw.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}
