//! Voxline - real-time voice conversations with a hosted assistant
//!
//! Run with `voxline` or `voxline daemon` to start the daemon.
//! Use `voxline session start|stop|toggle` to control it.
//! Use `voxline status --follow` to watch the session state.

use anyhow::Context;
use clap::Parser;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use voxline::cli::{self, Cli, Commands, SessionAction};
use voxline::config::{self, Config};
use voxline::daemon::Daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("voxline={},warn", log_level))),
        )
        .with_target(false)
        .init();

    // Load configuration
    let mut config = config::load_config(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(device) = cli.device {
        config.audio.device = device;
    }
    if let Some(voice) = cli.voice {
        config.transport.voice = voice;
    }
    if let Some(model) = cli.model {
        config.transport.model = model;
    }
    for raw in &cli.variables {
        let (name, value) = cli::parse_variable(raw)
            .with_context(|| format!("Invalid --var '{}', expected NAME=VALUE", raw))?;
        config.transport.variables.insert(name, value);
    }

    // Run the appropriate command
    match cli.command.unwrap_or(Commands::Daemon { auto_start: false }) {
        Commands::Daemon { auto_start } => {
            let mut daemon = Daemon::new(config, auto_start);
            daemon.run().await?;
        }

        Commands::Session { action } => {
            send_session_command(&config, action)?;
        }

        Commands::Status { follow, format } => {
            run_status(&config, follow, &format)?;
        }

        Commands::Config => {
            show_config(&config);
        }
    }

    Ok(())
}

/// Read the daemon PID and make sure the process is alive
fn daemon_pid() -> anyhow::Result<Pid> {
    let pid_path = Config::pid_file();
    let raw = std::fs::read_to_string(&pid_path).with_context(|| {
        format!(
            "Voxline daemon is not running (no PID file at {:?}). Start it with: voxline",
            pid_path
        )
    })?;
    let pid: i32 = raw
        .trim()
        .parse()
        .with_context(|| format!("Corrupt PID file at {:?}", pid_path))?;
    let pid = Pid::from_raw(pid);

    // Signal 0 only checks that the process exists
    kill(pid, None).with_context(|| format!("Voxline daemon (pid {}) is not running", pid))?;
    Ok(pid)
}

/// Read the current session state, or "stopped" when there is none
fn read_state(path: &Path) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "stopped".to_string())
}

/// Pick the signal that carries out a session action
fn session_signal(action: SessionAction, current_state: Option<&str>) -> Signal {
    match action {
        SessionAction::Start => Signal::SIGUSR1,
        SessionAction::Stop => Signal::SIGUSR2,
        SessionAction::Reset => Signal::SIGHUP,
        SessionAction::Toggle => match current_state {
            None | Some("idle") | Some("ended") | Some("stopped") => Signal::SIGUSR1,
            Some("error") => Signal::SIGHUP,
            Some(_) => Signal::SIGUSR2,
        },
    }
}

/// Control the running daemon with signals
fn send_session_command(config: &Config, action: SessionAction) -> anyhow::Result<()> {
    let pid = daemon_pid()?;

    let current_state = config.resolve_state_file().map(|path| read_state(&path));
    if action == SessionAction::Toggle && current_state.is_none() {
        tracing::debug!("No state file configured, toggle will start a session");
    }

    let signal = session_signal(action, current_state.as_deref());
    kill(pid, signal).with_context(|| format!("Failed to signal daemon (pid {})", pid))?;
    tracing::debug!("Sent {:?} to pid {}", signal, pid);

    Ok(())
}

fn print_state(state: &str, format: &str) {
    if format == "json" {
        println!("{}", format_state_json(state));
    } else {
        println!("{}", state);
    }
}

/// Show daemon status, optionally following changes
fn run_status(config: &Config, follow: bool, format: &str) -> anyhow::Result<()> {
    let Some(state_path) = config.resolve_state_file() else {
        eprintln!("Error: state_file is not configured.");
        eprintln!();
        eprintln!("To enable status monitoring, add to your config.toml:");
        eprintln!();
        eprintln!("  state_file = \"auto\"");
        std::process::exit(1);
    };

    let state = read_state(&state_path);
    print_state(&state, format);

    if !follow {
        return Ok(());
    }

    // Follow mode: watch for changes using inotify
    use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    let (tx, rx) = channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        NotifyConfig::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    // Watch the state file's parent directory (file may not exist yet)
    if let Some(parent) = state_path.parent() {
        std::fs::create_dir_all(parent)?;
        watcher.watch(parent, RecursiveMode::NonRecursive)?;
    }

    let mut last_state = state;

    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(_event)) => {
                if state_path.exists() {
                    let new_state = read_state(&state_path);
                    if new_state != last_state {
                        print_state(&new_state, format);
                        last_state = new_state;
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Watch error: {:?}", e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                // Check if file was deleted (daemon stopped)
                if !state_path.exists() && last_state != "stopped" {
                    print_state("stopped", format);
                    last_state = "stopped".to_string();
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}

/// Format state as JSON for Waybar consumption
fn format_state_json(state: &str) -> String {
    let (text, class, tooltip) = match state {
        "idle" => ("🎙️", "idle", "Voxline ready - run 'voxline session start'"),
        "connecting" => ("⏳", "connecting", "Connecting..."),
        "listening" => ("🎤", "listening", "Listening..."),
        "speaking" => ("🔊", "speaking", "Assistant speaking"),
        "error" => ("⚠", "error", "Session failed - run 'voxline session reset'"),
        "ended" => ("🎙️", "ended", "Session ended"),
        "stopped" => ("", "stopped", "Voxline not running"),
        _ => ("?", "unknown", "Unknown state"),
    };

    serde_json::json!({ "text": text, "class": class, "tooltip": tooltip }).to_string()
}

/// Show current configuration
fn show_config(config: &Config) {
    println!("Current Configuration\n");
    println!("=====================\n");

    println!("[audio]");
    println!("  device = {:?}", config.audio.device);
    println!("  sample_rate = {}", config.audio.sample_rate);
    println!("  window_size = {}", config.audio.window_size);

    println!("\n[playback]");
    println!("  sample_rate = {}", config.playback.sample_rate);
    println!("  channels = {}", config.playback.channels);
    println!("  volume = {}", config.playback.volume);

    println!("\n[transport]");
    println!("  endpoint = {:?}", config.transport.endpoint);
    println!("  model = {:?}", config.transport.model);
    println!("  voice = {:?}", config.transport.voice);
    println!(
        "  api_key = {}",
        if config.transport.api_key.is_some() {
            "(set)"
        } else {
            "(not set)"
        }
    );
    println!(
        "  connect_timeout_secs = {}",
        config.transport.connect_timeout_secs
    );

    println!("\n[transport.variables]");
    for (name, value) in &config.transport.variables {
        println!("  {} = {:?}", name, value);
    }

    if let Some(ref state_file) = config.state_file {
        println!("\n[integration]");
        println!("  state_file = {:?}", state_file);
        if let Some(resolved) = config.resolve_state_file() {
            println!("  (resolves to: {:?})", resolved);
        }
    }

    println!("\n---");
    println!(
        "Config file: {:?}",
        Config::default_path().unwrap_or_else(|| PathBuf::from("(not found)"))
    );
}
