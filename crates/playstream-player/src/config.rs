//! Player configuration for playstream-player
//!
//! Configuration is stored as YAML in the user's config directory.
//! Default location: ~/.config/playstream/config.yaml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Test tone and run length
    pub playback: PlaybackConfig,
    /// Which platform to open streams on
    pub backend: BackendConfig,
    /// Default log filter when RUST_LOG is not set
    pub log_level: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            playback: PlaybackConfig::default(),
            backend: BackendConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Playback section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Test tone frequency in Hz
    pub tone_frequency: f32,
    /// Peak amplitude, 0.0 to 1.0 of full scale
    pub amplitude: f32,
    /// Length of each buffer handed to the engine
    pub buffer_seconds: f32,
    /// Total playback time before shutting down
    pub run_seconds: f32,
    /// Raw 16-bit little-endian PCM file to play instead of the tone
    pub pcm_file: Option<PathBuf>,
    /// Start/stop cycles when playing a file, each lasting `run_seconds`
    pub start_stop_cycles: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tone_frequency: 440.0,
            amplitude: 0.25,
            buffer_seconds: 0.5,
            run_seconds: 5.0,
            pcm_file: None,
            start_stop_cycles: 1,
        }
    }
}

/// Backend section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Use the in-process simulated platform instead of a real device
    pub simulate: bool,
    /// Output device name, `None` for the system default
    pub device: Option<String>,
}

/// Get the default config file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("playstream")
        .join("config.yaml")
}

/// Load configuration from a YAML file
///
/// If the file doesn't exist, returns default config.
/// If the file exists but is invalid, logs a warning and returns default config.
pub fn load_config(path: &Path) -> PlayerConfig {
    log::info!("load_config: Loading from {:?}", path);

    if !path.exists() {
        log::info!("load_config: Config file doesn't exist, using defaults");
        return PlayerConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<PlayerConfig>(&contents) {
            Ok(config) => {
                log::info!(
                    "load_config: Loaded config - tone {:.1}Hz, simulate: {}, device: {:?}",
                    config.playback.tone_frequency,
                    config.backend.simulate,
                    config.backend.device
                );
                config
            }
            Err(e) => {
                log::warn!("load_config: Failed to parse config: {}, using defaults", e);
                PlayerConfig::default()
            }
        },
        Err(e) => {
            log::warn!("load_config: Failed to read config file: {}, using defaults", e);
            PlayerConfig::default()
        }
    }
}

/// Save configuration to a YAML file
///
/// Creates the parent directory if it doesn't exist.
pub fn save_config(config: &PlayerConfig, path: &Path) -> Result<()> {
    log::info!("save_config: Saving to {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    log::info!("save_config: Config saved successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PlayerConfig::default();
        assert_eq!(config.playback.tone_frequency, 440.0);
        assert!(!config.backend.simulate);
        assert!(config.backend.device.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.yaml"));
        assert_eq!(config, PlayerConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = PlayerConfig::default();
        config.playback.tone_frequency = 220.0;
        config.backend.simulate = true;
        config.backend.device = Some("USB Audio".to_string());
        config.playback.pcm_file = Some(PathBuf::from("/tmp/loop.pcm"));
        config.playback.start_stop_cycles = 3;
        save_config(&config, &path).unwrap();

        assert_eq!(load_config(&path), config);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "backend:\n  simulate: true\n").unwrap();

        let config = load_config(&path);
        assert!(config.backend.simulate);
        assert_eq!(config.playback, PlaybackConfig::default());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_pcm_file_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "playback:\n  pcm_file: /data/clip.pcm\n").unwrap();

        let config = load_config(&path);
        assert_eq!(config.playback.pcm_file, Some(PathBuf::from("/data/clip.pcm")));
        assert_eq!(config.playback.start_stop_cycles, 1);
    }

    #[test]
    fn test_invalid_yaml_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "playback: [not, a, map]\n").unwrap();

        assert_eq!(load_config(&path), PlayerConfig::default());
    }
}
