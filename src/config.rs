//! Configuration loading and types for voxline
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/voxline/config.toml)
//! 3. Environment variables (VOXLINE_*)
//! 4. CLI arguments (highest priority)

use crate::error::VoxlineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# Voxline Configuration
#
# Location: ~/.config/voxline/config.toml
# All settings can be overridden via CLI flags

# State file for external integrations (Waybar, polybar, widgets)
# Use "auto" for default location ($XDG_RUNTIME_DIR/voxline/state),
# a custom path, or "disabled" to turn off. The daemon writes the session
# state ("idle", "connecting", "listening", "speaking", "error") whenever
# it changes.
state_file = "auto"

[audio]
# Microphone device ("default" uses system default)
# List devices with: pactl list sources short
device = "default"

# Capture sample rate in Hz (the voice service expects 16000)
sample_rate = 16000

# Samples per outbound frame
window_size = 4096

[playback]
# Sample rate of synthesized speech in Hz
sample_rate = 24000

# Channels in synthesized speech
channels = 1

# Volume level (0.0 to 1.0)
volume = 1.0

[transport]
# Live API WebSocket endpoint
endpoint = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"

# Model identifier
model = "models/gemini-2.0-flash-live-001"

# Prebuilt voice for synthesized speech
voice = "Aoede"

# API key (prefer the VOXLINE_API_KEY environment variable)
# api_key = "..."

# Seconds to wait for the service to accept the session
connect_timeout_secs = 10

# Persona prompt, {{name}} placeholders are filled from [transport.variables]
system_instruction = "You are Melissa, the friendly voice assistant for a home heating and cooling company serving {{service_location}}. Greet {{user_name}}, answer questions about furnaces, heat pumps, rebates and service visits, and keep answers short."

[transport.variables]
user_name = "Valued Customer"
service_location = "Toronto/GTA"
"#;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Optional path to state file for external integrations (e.g., Waybar)
    /// When set, the daemon writes the current session state to this file
    /// whenever it changes.
    /// Example: "/run/user/1000/voxline/state" or use "auto" for default location
    #[serde(default)]
    pub state_file: Option<String>,
}

/// Microphone capture configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// PipeWire/PulseAudio device name, or "default"
    #[serde(default = "default_device")]
    pub device: String,

    /// Capture sample rate in Hz
    #[serde(default = "default_capture_rate")]
    pub sample_rate: u32,

    /// Samples per outbound frame
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

/// Speaker playback configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackConfig {
    /// Sample rate of inbound speech in Hz
    #[serde(default = "default_playback_rate")]
    pub sample_rate: u32,

    /// Channel count of inbound speech
    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Volume level (0.0 to 1.0)
    #[serde(default = "default_volume")]
    pub volume: f32,
}

/// Remote voice service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// WebSocket endpoint (wss://...)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Model identifier sent in the session setup
    #[serde(default = "default_model")]
    pub model: String,

    /// Prebuilt voice name
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Persona/business-rule prompt, opaque to the session core
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,

    /// API key (falls back to VOXLINE_API_KEY / GEMINI_API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Seconds to wait for the connection and setup handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Values substituted into `{{name}}` placeholders of the instruction
    #[serde(default = "default_variables")]
    pub variables: BTreeMap<String, String>,
}

fn default_device() -> String {
    "default".to_string()
}

fn default_capture_rate() -> u32 {
    crate::codec::CAPTURE_SAMPLE_RATE
}

fn default_window_size() -> usize {
    4096
}

fn default_playback_rate() -> u32 {
    crate::codec::PLAYBACK_SAMPLE_RATE
}

fn default_channels() -> u16 {
    1
}

fn default_volume() -> f32 {
    1.0
}

fn default_endpoint() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
}

fn default_model() -> String {
    "models/gemini-2.0-flash-live-001".to_string()
}

fn default_voice() -> String {
    "Aoede".to_string()
}

fn default_system_instruction() -> String {
    "You are Melissa, the friendly voice assistant for a home heating and cooling company \
     serving {{service_location}}. Greet {{user_name}}, answer questions about furnaces, \
     heat pumps, rebates and service visits, and keep answers short."
        .to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_variables() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("user_name".to_string(), "Valued Customer".to_string()),
        ("service_location".to_string(), "Toronto/GTA".to_string()),
    ])
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            sample_rate: default_capture_rate(),
            window_size: default_window_size(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_playback_rate(),
            channels: default_channels(),
            volume: default_volume(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            voice: default_voice(),
            system_instruction: default_system_instruction(),
            api_key: None,
            connect_timeout_secs: default_connect_timeout(),
            variables: default_variables(),
        }
    }
}

impl TransportConfig {
    /// System instruction with `{{name}}` placeholders filled in
    ///
    /// Placeholders without a matching variable are left as-is.
    pub fn rendered_instruction(&self) -> String {
        let mut text = self.system_instruction.clone();
        for (name, value) in &self.variables {
            text = text.replace(&format!("{{{{{}}}}}", name), value);
        }
        text
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            playback: PlaybackConfig::default(),
            transport: TransportConfig::default(),
            state_file: Some("auto".to_string()),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voxline")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the runtime directory for ephemeral files (state, pid)
    pub fn runtime_dir() -> PathBuf {
        // Use XDG_RUNTIME_DIR if available, otherwise fall back to /tmp
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join("voxline")
    }

    /// Path of the PID file written by the daemon
    pub fn pid_file() -> PathBuf {
        Self::runtime_dir().join("pid")
    }

    /// Resolve the state file path from config
    /// Returns None if state_file is not configured or explicitly disabled
    /// Returns the resolved path if set to "auto" or an explicit path
    pub fn resolve_state_file(&self) -> Option<PathBuf> {
        self.state_file.as_ref().and_then(|path| {
            match path.to_lowercase().as_str() {
                "disabled" | "none" | "off" | "false" => None,
                "auto" => Some(Self::runtime_dir().join("state")),
                _ => Some(PathBuf::from(path)),
            }
        })
    }

    /// Get the config directory path
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voxline")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(path: Option<&Path>) -> Result<Config, VoxlineError> {
    // Start with defaults
    let mut config = Config::default();

    // Determine config file path
    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    // Load from file if it exists
    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| VoxlineError::Config(format!("Failed to read config: {}", e)))?;

            config = toml::from_str(&contents)
                .map_err(|e| VoxlineError::Config(format!("Invalid config: {}", e)))?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    validate(&config)?;

    Ok(config)
}

/// Override config values from environment variables
fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(key) = var("VOXLINE_API_KEY").or_else(|| var("GEMINI_API_KEY")) {
        if !key.trim().is_empty() {
            config.transport.api_key = Some(key);
        }
    }
    if let Some(model) = var("VOXLINE_MODEL") {
        config.transport.model = model;
    }
    if let Some(voice) = var("VOXLINE_VOICE") {
        config.transport.voice = voice;
    }
    if let Some(device) = var("VOXLINE_DEVICE") {
        config.audio.device = device;
    }
}

/// Reject values the audio pipeline cannot work with
fn validate(config: &Config) -> Result<(), VoxlineError> {
    if config.audio.window_size == 0 {
        return Err(VoxlineError::Config(
            "audio.window_size must be greater than 0".into(),
        ));
    }
    if config.audio.sample_rate == 0 || config.playback.sample_rate == 0 {
        return Err(VoxlineError::Config("sample rates must be greater than 0".into()));
    }
    if config.playback.channels == 0 {
        return Err(VoxlineError::Config(
            "playback.channels must be greater than 0".into(),
        ));
    }
    if !(0.0..=1.0).contains(&config.playback.volume) {
        return Err(VoxlineError::Config(format!(
            "playback.volume must be between 0.0 and 1.0, got {}",
            config.playback.volume
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.audio.device, "default");
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.window_size, 4096);
        assert_eq!(config.playback.sample_rate, 24000);
        assert_eq!(config.playback.channels, 1);
        assert!(config.transport.api_key.is_none());
        assert_eq!(config.transport.connect_timeout_secs, 10);
    }

    #[test]
    fn test_default_config_text_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.audio.window_size, 4096);
        assert_eq!(config.transport.voice, "Aoede");
        assert_eq!(
            config.transport.variables.get("service_location").map(String::as_str),
            Some("Toronto/GTA")
        );
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
            [audio]
            device = "USB Mic"

            [transport]
            voice = "Kore"
            api_key = "secret"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.audio.device, "USB Mic");
        assert_eq!(config.audio.window_size, 4096); // default
        assert_eq!(config.playback.sample_rate, 24000); // default section
        assert_eq!(config.transport.voice, "Kore");
        assert_eq!(config.transport.api_key.as_deref(), Some("secret"));
        assert!(config.transport.endpoint.starts_with("wss://"));
    }

    #[test]
    fn test_rendered_instruction() {
        let mut transport = TransportConfig {
            system_instruction: "Hi {{user_name}} from {{service_location}}, {{unknown}}".into(),
            ..TransportConfig::default()
        };
        transport
            .variables
            .insert("user_name".into(), "Sam".into());

        assert_eq!(
            transport.rendered_instruction(),
            "Hi Sam from Toronto/GTA, {{unknown}}"
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GEMINI_API_KEY", "from-gemini"),
            ("VOXLINE_VOICE", "Puck"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.transport.api_key.as_deref(), Some("from-gemini"));
        assert_eq!(config.transport.voice, "Puck");
        assert_eq!(config.transport.model, default_model());
    }

    #[test]
    fn test_voxline_key_wins_over_gemini_key() {
        let env: HashMap<&str, &str> = [
            ("GEMINI_API_KEY", "from-gemini"),
            ("VOXLINE_API_KEY", "from-voxline"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.transport.api_key.as_deref(), Some("from-voxline"));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = Config::default();
        config.audio.window_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_resolve_state_file() {
        let mut config = Config::default();
        assert!(config.resolve_state_file().unwrap().ends_with("voxline/state"));

        config.state_file = Some("disabled".into());
        assert!(config.resolve_state_file().is_none());

        config.state_file = Some("/tmp/custom-state".into());
        assert_eq!(
            config.resolve_state_file(),
            Some(PathBuf::from("/tmp/custom-state"))
        );
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[audio]\nwindow_size = 2048\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.audio.window_size, 2048);
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[audio\n").unwrap();

        assert!(matches!(
            load_config(Some(&path)),
            Err(VoxlineError::Config(_))
        ));
    }
}
