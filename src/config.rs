use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::scheduler::PlaybackTiming;
use crate::synth::Envelope;

pub const DEFAULT_CONFIG_PATH: &str = "fieldbeat.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_base_url")]
    pub base_url: String,
    /// Session token, sent as the `token` cookie.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "ServerConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ServerConfig {
    fn default_base_url() -> String {
        "http://localhost:8000/api".to_string()
    }
    fn default_timeout_ms() -> u64 {
        10_000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            token: None,
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "AudioConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "AudioConfig::default_volume")]
    pub volume: f32,
    #[serde(default = "AudioConfig::default_sustain_level")]
    pub sustain_level: f32,
}

impl AudioConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_volume() -> f32 {
        1.0
    }
    fn default_sustain_level() -> f32 {
        0.3
    }

    pub fn envelope(&self) -> Envelope {
        Envelope {
            sustain_level: self.sustain_level.clamp(0.0, 1.0),
            ..Envelope::default()
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            volume: Self::default_volume(),
            sustain_level: Self::default_sustain_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "PlaybackConfig::default_lead_in_ms")]
    pub lead_in_ms: u64,
    #[serde(default = "PlaybackConfig::default_active_ratio")]
    pub active_ratio: f64,
    #[serde(default = "PlaybackConfig::default_feedback_ms")]
    pub feedback_ms: u64,
    /// Tempo used when a sheet arrives without one.
    #[serde(default = "PlaybackConfig::default_tempo")]
    pub default_tempo: u32,
}

impl PlaybackConfig {
    fn default_lead_in_ms() -> u64 {
        500
    }
    fn default_active_ratio() -> f64 {
        0.7
    }
    fn default_feedback_ms() -> u64 {
        150
    }
    fn default_tempo() -> u32 {
        120
    }

    pub fn timing(&self) -> PlaybackTiming {
        PlaybackTiming {
            lead_in: Duration::from_millis(self.lead_in_ms),
            active_ratio: self.active_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn feedback(&self) -> Duration {
        Duration::from_millis(self.feedback_ms)
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            lead_in_ms: Self::default_lead_in_ms(),
            active_ratio: Self::default_active_ratio(),
            feedback_ms: Self::default_feedback_ms(),
            default_tempo: Self::default_tempo(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    /// Restart the input cursor when a hint is replayed mid-input.
    #[serde(default)]
    pub hint_resets_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "LogConfig::default_file")]
    pub file: PathBuf,
}

impl LogConfig {
    fn default_file() -> PathBuf {
        PathBuf::from("fieldbeat.log")
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: Self::default_file(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Like [`AppConfig::load`], but falls back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("Failed to load config {}: {err}. Using defaults.", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.playback.timing(), PlaybackTiming::default());
        assert!(!cfg.game.hint_resets_progress);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldbeat.toml");
        fs::write(
            &path,
            "[server]\nbase_url = \"https://game.example/api\"\n\n[game]\nhint_resets_progress = true\n",
        )
        .unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.server.base_url, "https://game.example/api");
        assert_eq!(cfg.server.timeout_ms, 10_000);
        assert!(cfg.game.hint_resets_progress);
        assert_eq!(cfg.playback.feedback_ms, 150);
    }

    #[test]
    fn save_then_load_restores_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldbeat.toml");
        let mut cfg = AppConfig::default();
        cfg.server.token = Some("abc".into());
        cfg.playback.lead_in_ms = 250;
        cfg.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldbeat.toml");
        fs::write(&path, "[server\n").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Parse(_))));
        assert_eq!(AppConfig::load_or_default(&path), AppConfig::default());
    }
}
