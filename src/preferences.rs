use crate::error::Result;
use log::warn;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Preferences {
    /// Where weights and projectors live; `<data dir>/models` when unset.
    pub models_dir: Option<PathBuf>,
    /// The llama.cpp multimodal CLI; searched for when unset.
    pub llama_binary: Option<PathBuf>,
    /// Zero disables the limit.
    pub inference_timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub gpu_layers: u32,
    pub active_model: Option<String>,
    pub shared_inbox: Option<PathBuf>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            models_dir: None,
            llama_binary: None,
            inference_timeout_secs: 120,
            max_tokens: 512,
            temperature: 0.7,
            gpu_layers: 99, // all layers on the GPU
            active_model: None,
            shared_inbox: None,
        }
    }
}

impl Preferences {
    pub fn inference_timeout(&self) -> Option<Duration> {
        (self.inference_timeout_secs > 0).then(|| Duration::from_secs(self.inference_timeout_secs))
    }
}

pub struct PreferencesManager {
    preferences: Arc<RwLock<Preferences>>,
    config_path: PathBuf,
    data_dir: PathBuf,
}

impl PreferencesManager {
    pub fn new() -> Result<Self> {
        let project_dirs = directories::ProjectDirs::from("com", "realingo", "Realingo")
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "Failed to get project directories")
            })?;

        let config_dir = project_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;

        Self::with_paths(
            config_dir.join("preferences.json"),
            project_dirs.data_dir().to_path_buf(),
        )
    }

    /// Loads `config_path`, falling back to defaults when it is missing or
    /// unreadable as preferences.
    pub fn with_paths(config_path: PathBuf, data_dir: PathBuf) -> Result<Self> {
        let preferences = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring corrupt preferences {:?}: {}", config_path, e);
                Preferences::default()
            })
        } else {
            Preferences::default()
        };

        Ok(Self {
            preferences: Arc::new(RwLock::new(preferences)),
            config_path,
            data_dir,
        })
    }

    pub async fn get_preferences(&self) -> Preferences {
        self.preferences.read().await.clone()
    }

    pub async fn models_dir(&self) -> PathBuf {
        self.preferences
            .read()
            .await
            .models_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }

    pub async fn shared_inbox_path(&self) -> PathBuf {
        self.preferences
            .read()
            .await
            .shared_inbox
            .clone()
            .unwrap_or_else(|| self.data_dir.join("shared").join("inbox.json"))
    }

    pub async fn set_active_model(&self, model_id: Option<String>) -> Result<()> {
        let mut prefs = self.preferences.write().await;
        prefs.active_model = model_id;
        self.save(&prefs).await
    }

    pub async fn set_models_dir(&self, dir: Option<PathBuf>) -> Result<()> {
        let mut prefs = self.preferences.write().await;
        prefs.models_dir = dir;
        self.save(&prefs).await
    }

    async fn save(&self, prefs: &Preferences) -> Result<()> {
        let json = serde_json::to_string_pretty(prefs).map_err(io::Error::from)?;
        if let Some(dir) = self.config_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.config_path, json).await?;
        Ok(())
    }
}
