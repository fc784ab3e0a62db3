use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::config_dir;

const TOKEN_FILE: &str = "token.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
struct StoredToken {
    #[serde(default)]
    token: String,
}

/// The API token, kept in a small TOML file between runs.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    /// Store at `~/.config/mqttdash/token.toml`.
    pub fn new() -> Self {
        Self::at(config_dir().join(TOKEN_FILE))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved token, or `None` if nothing usable was stored.
    pub async fn load(&self) -> Result<Option<String>> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| eyre!("Failed to check if token file exists: {}", e))?
        {
            debug!("No token file at {}", self.path.display());
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| eyre!("Failed to read token file: {}", e))?;
        let stored: StoredToken =
            toml::from_str(&content).map_err(|e| eyre!("Failed to parse token file: {}", e))?;

        let token = stored.token.trim().to_string();
        Ok((!token.is_empty()).then_some(token))
    }

    /// Stores `token` without surrounding whitespace and returns what was stored.
    pub async fn save(&self, token: &str) -> Result<String> {
        let token = token.trim();
        if token.is_empty() {
            return Err(eyre!("Refusing to store an empty token"));
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string(&StoredToken {
            token: token.to_string(),
        })
        .map_err(|e| eyre!("Failed to serialize token: {}", e))?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| eyre!("Failed to write token file: {}", e))?;

        info!("API token saved to {}", self.path.display());
        Ok(token.to_string())
    }
}
