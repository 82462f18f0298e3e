// This module handles config.toml: listen address, model and weight
// directories, and model aliases. The config is read once at startup and
// shared read-only from there.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory holding the `<name>.safetensors` checkpoints requests may
    /// refer to.
    pub models_dir: PathBuf,
    /// Directory holding detector and upscaler weights.
    #[serde(default = "default_weights_dir")]
    pub weights_dir: PathBuf,
    /// Model-name aliases, chased before hitting the models directory.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    #[serde(default)]
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectorConfig {
    #[serde(default = "default_face_weights")]
    pub face_weights: String,
    #[serde(default = "default_hand_weights")]
    pub hand_weights: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            face_weights: default_face_weights(),
            hand_weights: default_hand_weights(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9149".to_owned()
}

fn default_weights_dir() -> PathBuf {
    PathBuf::from("weights")
}

fn default_face_weights() -> String {
    "face_yolov8n.pt".to_owned()
}

fn default_hand_weights() -> String {
    "hand_yolov9c.pt".to_owned()
}

impl ServerConfig {
    pub fn face_weights(&self) -> PathBuf {
        self.weights_dir.join(&self.detector.face_weights)
    }

    pub fn hand_weights(&self) -> PathBuf {
        self.weights_dir.join(&self.detector.hand_weights)
    }
}

#[derive(Clone)]
pub struct ConfigModule(Arc<RwLock<ServerConfig>>);

impl ConfigModule {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Error reading {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("Error parsing {}", path.display()))?;

        Ok(Self(Arc::new(RwLock::new(config))))
    }

    pub async fn with_config<T>(&self, f: impl FnOnce(&ServerConfig) -> T) -> T {
        f(&*self.0.read().await)
    }

    #[cfg(test)]
    pub fn for_tests(config: ServerConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }
}

#[cfg(test)]
pub fn testconfig(models_dir: &Path) -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".to_owned(),
        models_dir: models_dir.to_path_buf(),
        weights_dir: PathBuf::from("weights"),
        aliases: HashMap::new(),
        detector: DetectorConfig::default(),
    }
}
