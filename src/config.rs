use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::detector::DEFAULT_BATCH_SIZE;
use crate::export::DEFAULT_FILE_NAME;

/// Environment variable holding the map tile access token.
pub const MAP_TOKEN_VAR: &str = "MAPBOX_TOKEN";
/// Environment variable overriding `inference.output_dir`.
pub const OUTPUT_DIR_VAR: &str = "OSM_TRIAGE_OUTPUT_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("cannot write config {}: {message}", .path.display())]
    Write { path: PathBuf, message: String },
    #[error("no configuration directory on this platform")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub map: MapConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub output_dir: PathBuf,
    /// Side length of the query area in kilometers.
    pub margin_km: f64,
    pub batch_size: usize,
    pub save_full_images: bool,
    pub detector_command: String,
    pub detector_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub endpoint: String,
    pub repo_id: String,
    pub revision: String,
    pub filename: String,
    pub local_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub file_name: String,
    /// Tags applied to every exported feature.
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MapConfig {
    /// Enables authenticated (satellite) map tiles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_tile_token: Option<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/tmp/results"),
            margin_km: 2.0,
            batch_size: DEFAULT_BATCH_SIZE,
            save_full_images: false,
            detector_command: "osm-detect".to_string(),
            detector_args: Vec::new(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
            repo_id: "mozilla-ai/swimming-pool-detector".to_string(),
            revision: "main".to_string(),
            filename: "model.pt".to_string(),
            local_dir: PathBuf::from("models"),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            file_name: DEFAULT_FILE_NAME.to_string(),
            tags: BTreeMap::from([("golf".to_string(), "feature".to_string())]),
        }
    }
}

impl MapConfig {
    /// XYZ tile URL template for displaying the query area.
    pub fn tile_url_template(&self) -> String {
        match &self.map_tile_token {
            Some(token) => format!(
                "https://api.mapbox.com/styles/v1/mapbox/satellite-v9/tiles/{{z}}/{{x}}/{{y}}?access_token={token}"
            ),
            None => "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
        }
    }

    pub fn tile_provider(&self) -> &'static str {
        if self.map_tile_token.is_some() {
            "mapbox satellite (authenticated)"
        } else {
            "openstreetmap"
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must exist and parse. Without one, the per-user
    /// config file is used when present and defaults otherwise. Environment
    /// overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => Self::read(path)?,
            None => match Self::config_file_path() {
                Some(path) if path.is_file() => Self::read(&path)?,
                _ => Self::default(),
            },
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides, looking variables up through `lookup`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(token) = lookup(MAP_TOKEN_VAR).filter(|t| !t.is_empty()) {
            self.map.map_tile_token = Some(token);
        }
        if let Some(dir) = lookup(OUTPUT_DIR_VAR).filter(|d| !d.is_empty()) {
            self.inference.output_dir = PathBuf::from(dir);
        }
        self
    }

    /// A copy safe to print: secrets are masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.map.map_tile_token.is_some() {
            copy.map.map_tile_token = Some("********".to_string());
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |message: String| ConfigError::Write {
            path: path.to_path_buf(),
            message,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        let content = self.to_toml().map_err(|e| write_err(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| write_err(e.to_string()))
    }

    pub fn config_file_path() -> Option<PathBuf> {
        Self::config_dir().map(|mut path| {
            path.push("config.toml");
            path
        })
    }

    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push("osm-triage");
            path
        })
    }
}
