//! Daemon module - main event loop orchestration
//!
//! Runs the session manager on its own task and feeds it commands from
//! Unix signals, so compositor keybindings and scripts can drive a voice
//! session with `voxline session start|stop|toggle`. Every state change is
//! mirrored to the state file for status bars.

use crate::config::Config;
use crate::error::{Result, VoxlineError};
use crate::session::{Command, SessionManager};
use crate::state::SessionState;
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};

/// Commands waiting for the session task
const COMMAND_BUFFER: usize = 16;

/// Write state to file for external integrations (e.g., Waybar)
pub fn write_state_file(path: &Path, state: &str) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create state file directory: {}", e);
            return;
        }
    }

    if let Err(e) = std::fs::write(path, state) {
        tracing::warn!("Failed to write state file: {}", e);
    } else {
        tracing::trace!("State file updated: {}", state);
    }
}

/// Remove a runtime file on shutdown
fn cleanup_file(path: &Path, what: &str) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove {}: {}", what, e);
        }
    }
}

/// Write PID file for external control via signals
fn write_pid_file() -> Option<PathBuf> {
    let pid_path = Config::pid_file();

    if let Some(parent) = pid_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create PID file directory: {}", e);
            return None;
        }
    }

    let pid = std::process::id();
    if let Err(e) = std::fs::write(&pid_path, pid.to_string()) {
        tracing::warn!("Failed to write PID file: {}", e);
        return None;
    }

    tracing::debug!("PID file written: {:?} (pid={})", pid_path, pid);
    Some(pid_path)
}

/// Mirror session states into the state file until the manager goes away
async fn track_state(mut updates: broadcast::Receiver<SessionState>, path: Option<PathBuf>) {
    loop {
        match updates.recv().await {
            Ok(state) => {
                tracing::info!("Session state: {}", state);
                if let Some(ref path) = path {
                    write_state_file(path, state.as_str());
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("State tracker skipped {} update(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn signal_handler(kind: SignalKind, name: &str) -> Result<tokio::signal::unix::Signal> {
    signal(kind).map_err(|e| {
        VoxlineError::Config(format!("Failed to set up {} handler: {}", name, e))
    })
}

/// Main daemon that hosts one session manager
pub struct Daemon {
    config: Config,
    auto_start: bool,
    state_file_path: Option<PathBuf>,
    pid_file_path: Option<PathBuf>,
}

impl Daemon {
    pub fn new(config: Config, auto_start: bool) -> Self {
        let state_file_path = config.resolve_state_file();
        Self {
            config,
            auto_start,
            state_file_path,
            pid_file_path: None,
        }
    }

    /// Run the daemon main loop
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("Starting voxline daemon");

        if self.config.transport.api_key.is_none() {
            tracing::warn!("No API key configured; sessions will fail until VOXLINE_API_KEY is set");
        }

        self.pid_file_path = write_pid_file();

        // SIGUSR1 opens and starts, SIGUSR2 stops, SIGHUP clears an error
        let mut sigusr1 = signal_handler(SignalKind::user_defined1(), "SIGUSR1")?;
        let mut sigusr2 = signal_handler(SignalKind::user_defined2(), "SIGUSR2")?;
        let mut sighup = signal_handler(SignalKind::hangup(), "SIGHUP")?;
        let mut sigterm = signal_handler(SignalKind::terminate(), "SIGTERM")?;

        if let Some(ref path) = self.state_file_path {
            tracing::info!("State file: {:?}", path);
            write_state_file(path, SessionState::Idle.as_str());
        }

        tracing::info!(
            "Audio: device={}, capture {} Hz, playback {} Hz",
            self.config.audio.device,
            self.config.audio.sample_rate,
            self.config.playback.sample_rate
        );

        let mut manager = SessionManager::from_config(&self.config);
        let tracker = tokio::spawn(track_state(
            manager.subscribe(),
            self.state_file_path.clone(),
        ));

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let session_task = tokio::spawn(async move {
            manager.run(rx).await;
        });

        if self.auto_start {
            let _ = tx.send(Command::Trigger { auto_start: true }).await;
        } else {
            tracing::info!("Waiting for a trigger: voxline session start (SIGUSR1)");
        }

        loop {
            let command = tokio::select! {
                _ = sigusr1.recv() => {
                    tracing::debug!("Received SIGUSR1 (start)");
                    Command::Trigger { auto_start: true }
                }
                _ = sigusr2.recv() => {
                    tracing::debug!("Received SIGUSR2 (stop)");
                    Command::Stop
                }
                _ = sighup.recv() => {
                    tracing::debug!("Received SIGHUP (reset)");
                    Command::Reset
                }

                // Handle graceful shutdown (SIGINT from Ctrl+C)
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT, shutting down...");
                    break;
                }

                // Handle graceful shutdown (SIGTERM from systemctl stop)
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down...");
                    break;
                }
            };

            if tx.send(command).await.is_err() {
                tracing::error!("Session task exited unexpectedly");
                break;
            }
        }

        // Closing the channel makes the manager stop any live session
        drop(tx);
        if let Err(e) = session_task.await {
            tracing::warn!("Session task failed: {}", e);
        }
        if let Err(e) = tracker.await {
            tracing::warn!("State tracker failed: {}", e);
        }

        if let Some(ref path) = self.state_file_path {
            cleanup_file(path, "state file");
        }
        if let Some(ref path) = self.pid_file_path {
            cleanup_file(path, "PID file");
        }

        tracing::info!("Daemon stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_state_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state");

        write_state_file(&path, "listening");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "listening");

        write_state_file(&path, "idle");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "idle");
    }

    #[test]
    fn test_cleanup_missing_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        cleanup_file(&path, "state file");

        std::fs::write(&path, "idle").unwrap();
        cleanup_file(&path, "state file");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_track_state_mirrors_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let (tx, rx) = broadcast::channel(8);

        let task = tokio::spawn(track_state(rx, Some(path.clone())));
        tx.send(SessionState::Connecting).unwrap();
        tx.send(SessionState::Listening).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "listening");
    }
}
