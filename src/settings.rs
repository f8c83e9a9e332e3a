use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::render::RenderError;

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "ghostview";

/// Resolution used for the thumbnails produced when a document is opened.
pub const DEFAULT_LOW_DPI: u32 = 20;
/// Resolution of the high tier; zoom factors scale this value.
pub const DEFAULT_HIGH_DPI: u32 = 72;
/// Pages on each side of the current one kept at high resolution.
pub const DEFAULT_PREFETCH_RADIUS: usize = 2;
/// Pages on each side of the zoomed page rendered by a zoom request.
pub const DEFAULT_ZOOM_NEIGHBOURS: usize = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_low_dpi")]
    pub low_dpi: u32,

    #[serde(default = "default_high_dpi")]
    pub high_dpi: u32,

    #[serde(default = "default_prefetch_radius")]
    pub prefetch_radius: usize,

    #[serde(default = "default_zoom_neighbours")]
    pub zoom_neighbours: usize,

    /// Text and graphics anti-aliasing in the engine
    #[serde(default = "default_true")]
    pub antialiasing: bool,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_low_dpi() -> u32 {
    DEFAULT_LOW_DPI
}

fn default_high_dpi() -> u32 {
    DEFAULT_HIGH_DPI
}

fn default_prefetch_radius() -> usize {
    DEFAULT_PREFETCH_RADIUS
}

fn default_zoom_neighbours() -> usize {
    DEFAULT_ZOOM_NEIGHBOURS
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            low_dpi: DEFAULT_LOW_DPI,
            high_dpi: DEFAULT_HIGH_DPI,
            prefetch_radius: DEFAULT_PREFETCH_RADIUS,
            zoom_neighbours: DEFAULT_ZOOM_NEIGHBOURS,
            antialiasing: true,
        }
    }
}

impl RenderSettings {
    /// Parses settings from YAML, filling missing fields with defaults.
    pub fn from_yaml(content: &str) -> Result<Self, RenderError> {
        let settings: RenderSettings =
            serde_yaml::from_str(content).map_err(|e| RenderError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads settings from `path`.
    pub fn load_from(path: &Path) -> Result<Self, RenderError> {
        let content = fs::read_to_string(path)?;
        let settings = Self::from_yaml(&content)?;
        debug!("Loaded settings from {path:?}");
        if settings.version < CURRENT_VERSION {
            info!(
                "Settings at {path:?} are v{}, current is v{CURRENT_VERSION}",
                settings.version
            );
        }
        Ok(settings)
    }

    /// Loads settings from the default location, falling back to defaults.
    #[must_use]
    pub fn load_or_default() -> Self {
        let Some(path) = default_config_path() else {
            warn!("Could not determine config directory, using default settings");
            return Self::default();
        };
        if !path.exists() {
            debug!("No settings at {path:?}, using defaults");
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Failed to load settings file {path:?}: {e}");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        if self.low_dpi == 0 || self.high_dpi == 0 {
            return Err(RenderError::Config(
                "resolutions must be greater than zero".to_string(),
            ));
        }
        if self.low_dpi > self.high_dpi {
            return Err(RenderError::Config(format!(
                "low_dpi ({}) exceeds high_dpi ({})",
                self.low_dpi, self.high_dpi
            )));
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_fields_use_defaults() {
        let settings = RenderSettings::from_yaml("high_dpi: 96\n").unwrap();
        assert_eq!(settings.high_dpi, 96);
        assert_eq!(settings.low_dpi, DEFAULT_LOW_DPI);
        assert_eq!(settings.prefetch_radius, DEFAULT_PREFETCH_RADIUS);
        assert!(settings.antialiasing);
    }

    #[test]
    fn inverted_resolutions_are_rejected() {
        let err = RenderSettings::from_yaml("low_dpi: 100\nhigh_dpi: 50\n").unwrap_err();
        assert!(matches!(err, RenderError::Config(_)));
    }

    #[test]
    fn zero_dpi_is_rejected() {
        assert!(RenderSettings::from_yaml("low_dpi: 0\n").is_err());
    }

    #[test]
    fn malformed_yaml_is_config_error() {
        let err = RenderSettings::from_yaml("low_dpi: [").unwrap_err();
        assert!(matches!(err, RenderError::Config(_)));
    }

    #[test]
    fn load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILENAME);
        fs::write(&path, "antialiasing: false\nprefetch_radius: 3\n").unwrap();

        let settings = RenderSettings::load_from(&path).unwrap();
        assert!(!settings.antialiasing);
        assert_eq!(settings.prefetch_radius, 3);
    }
}
