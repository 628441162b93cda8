//! Persistent Settings
//!
//! Decode and presentation preferences, stored as JSON in the platform
//! config directory.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::media::VideoFormat;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // === Video ===
    /// Codec preference order, most preferred first.
    pub codec_preference: Vec<VideoFormat>,

    /// Target FPS (drives queue-delay estimates and timestamp repair).
    pub fps: u32,

    /// Custom resolution (e.g., "1920x1080")
    pub resolution: String,

    /// Draw decoded frames immediately instead of on the next redraw.
    pub low_latency_mode: bool,

    /// Force a specific renderer instead of automatic selection.
    pub forced_renderer: Option<ForcedRenderer>,

    /// Deny H.264 High 4:4:4 decode even where the backend reports support.
    pub disable_high444_decode: bool,

    // === Audio ===
    /// Enable surround sound negotiation.
    pub surround: bool,

    // === Diagnostics ===
    /// Mirror logs to a file under the app data directory.
    pub log_to_file: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            codec_preference: vec![
                VideoFormat::Av1Main8,
                VideoFormat::H265,
                VideoFormat::H264,
            ],
            fps: 60,
            resolution: "1920x1080".to_string(),
            low_latency_mode: true,
            forced_renderer: None,
            disable_high444_decode: false,
            surround: false,
            log_to_file: true,
        }
    }
}

/// Renderer override, mirroring the builder's renderer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForcedRenderer {
    GpuYuv,
    RgbaBuffer,
    MediaSource,
}

impl Settings {
    fn file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("farview-streamer").join("settings.json"))
    }

    /// Load settings from disk, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::file_path().ok_or_else(|| anyhow::anyhow!("No config directory"))?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Save settings to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::file_path().ok_or_else(|| anyhow::anyhow!("No config directory"))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Get resolution as (width, height)
    pub fn resolution_tuple(&self) -> (u32, u32) {
        let parts: Vec<&str> = self.resolution.split('x').collect();
        if parts.len() == 2 {
            let width = parts[0].parse().unwrap_or(1920);
            let height = parts[1].parse().unwrap_or(1080);
            (width, height)
        } else {
            (1920, 1080)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_through_json() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.codec_preference, settings.codec_preference);
        assert_eq!(back.fps, 60);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let back: Settings = serde_json::from_str(r#"{"fps": 120}"#).unwrap();
        assert_eq!(back.fps, 120);
        assert!(back.low_latency_mode);
    }

    #[test]
    fn test_resolution_parsing() {
        let mut settings = Settings::default();
        settings.resolution = "2560x1440".into();
        assert_eq!(settings.resolution_tuple(), (2560, 1440));
        settings.resolution = "garbage".into();
        assert_eq!(settings.resolution_tuple(), (1920, 1080));
    }
}
