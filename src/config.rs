use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use crate::resolve::DeviceCeiling;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults — the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Device playback ceiling. Downconversion target, never upconversion.
    pub max_sample_rate_hz: u32,
    pub max_bit_depth: u16,

    /// Scan worker count. I/O-bound, so the default is well above core
    /// count (NAS metadata reads dominate).
    pub scan_threads: usize,
    /// Build worker count. 0 = auto-detect from CPU cores.
    pub build_jobs: usize,

    /// Minimum artwork resolution (pixels per side) for GREEN status.
    pub art_min_size: u32,
    /// Allowed drift between source and output duration at verify time.
    pub duration_tolerance_secs: f64,

    /// External tool paths.
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_sample_rate_hz: 48_000,
            max_bit_depth: 16,
            scan_threads: 32,
            build_jobs: 0,
            art_min_size: 300,
            duration_tolerance_secs: 1.0,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }
}

impl AppConfig {
    /// Load config from an explicit path, or `~/.config/podprep/config.toml`.
    /// Returns defaults if no file exists; logs a warning if a file exists
    /// but can't be parsed.
    pub fn load(explicit: Option<&Path>) -> Self {
        let path = explicit
            .map(|p| p.to_path_buf())
            .or_else(Self::config_path);

        match path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn ceiling(&self) -> DeviceCeiling {
        DeviceCeiling {
            max_sample_rate_hz: self.max_sample_rate_hz,
            max_bit_depth: self.max_bit_depth,
            max_channels: 2,
        }
    }

    /// Resolve build worker count: 0 → auto-detect from cores.
    pub fn resolve_build_jobs(&self) -> usize {
        if self.build_jobs > 0 {
            self.build_jobs
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_device_safe() {
        let config = AppConfig::default();
        assert_eq!(config.max_sample_rate_hz, 48_000);
        assert_eq!(config.max_bit_depth, 16);
        assert!(config.resolve_build_jobs() >= 1);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: AppConfig = toml::from_str("max_sample_rate_hz = 44100").unwrap();
        assert_eq!(config.max_sample_rate_hz, 44_100);
        assert_eq!(config.max_bit_depth, 16);
        assert_eq!(config.ffprobe_path, "ffprobe");
    }
}
