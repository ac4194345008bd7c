// appinapp-core/src/config.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::loader::LoadMode;
use crate::orchestrator::OrchestratorTiming;
use crate::scanner::{BundleScanner, DEFAULT_EXTENSIONS};
use crate::window::Geometry;

pub const CONFIG_FILE_NAME: &str = "appinapp.toml";
pub const APP_DIR_NAME: &str = "appinapp";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config directory not found")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widget_folder: Option<PathBuf>,
    pub mode: LoadMode,
    pub extensions: Vec<String>,
    pub debounce_ms: u64,
    pub effect_reassert_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    pub default_geometry: Geometry,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            widget_folder: None,
            mode: LoadMode::default(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            debounce_ms: 300,
            effect_reassert_ms: 2000,
            state_file: None,
            default_geometry: Geometry::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn load() -> Result<Self, ConfigError> {
        // Priority: ./appinapp.toml -> ~/.config/appinapp/appinapp.toml -> default
        let paths = [
            std::env::current_dir()?.join(CONFIG_FILE_NAME),
            dirs::config_dir()
                .ok_or(ConfigError::NoConfigDir)?
                .join(APP_DIR_NAME)
                .join(CONFIG_FILE_NAME),
        ];

        for path in paths {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn timing(&self) -> OrchestratorTiming {
        OrchestratorTiming {
            debounce: Duration::from_millis(self.debounce_ms),
            reassert: Duration::from_millis(self.effect_reassert_ms),
        }
    }

    pub fn scanner(&self) -> BundleScanner {
        if self.extensions.is_empty() {
            BundleScanner::default()
        } else {
            BundleScanner::new(self.extensions.clone())
        }
    }

    /// Folder to scan when neither the file nor the store names one.
    pub fn default_widget_folder() -> Option<PathBuf> {
        dirs::document_dir()
            .or_else(dirs::home_dir)
            .map(|d| d.join(APP_DIR_NAME))
    }

    /// The persisted setting wins over the file.
    pub fn resolve_widget_folder(&self, persisted: Option<PathBuf>) -> Option<PathBuf> {
        persisted
            .or_else(|| self.widget_folder.clone())
            .or_else(Self::default_widget_folder)
    }

    pub fn state_file_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.state_file {
            Some(path) => Ok(path.clone()),
            None => Ok(dirs::config_dir()
                .ok_or(ConfigError::NoConfigDir)?
                .join(APP_DIR_NAME)
                .join("state.toml")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.mode, LoadMode::Packaged);
        assert_eq!(config.extensions, vec!["lua", "luax"]);
        assert_eq!(config.timing(), OrchestratorTiming::default());
        assert_eq!(config.default_geometry, Geometry::default());
    }

    #[test]
    fn test_partial_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
widget_folder = "/tmp/widgets"
mode = "live"
debounce_ms = 50

[default_geometry]
width = 480.0
"#,
        )
        .unwrap();

        let config = RuntimeConfig::load_from(&path).unwrap();
        assert_eq!(config.widget_folder, Some(PathBuf::from("/tmp/widgets")));
        assert_eq!(config.mode, LoadMode::Live);
        assert_eq!(config.timing().debounce, Duration::from_millis(50));
        assert_eq!(config.timing().reassert, Duration::from_millis(2000));
        assert_eq!(config.default_geometry.width, 480.0);
        assert_eq!(config.default_geometry.height, 200.0);
    }

    #[test]
    fn test_bad_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "mode = \"sideways\"").unwrap();
        assert!(matches!(
            RuntimeConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            RuntimeConfig::load_from(&tmp.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_persisted_folder_wins() {
        let config = RuntimeConfig {
            widget_folder: Some(PathBuf::from("/from/file")),
            ..RuntimeConfig::default()
        };
        assert_eq!(
            config.resolve_widget_folder(Some(PathBuf::from("/from/store"))),
            Some(PathBuf::from("/from/store"))
        );
        assert_eq!(
            config.resolve_widget_folder(None),
            Some(PathBuf::from("/from/file"))
        );
    }
}
