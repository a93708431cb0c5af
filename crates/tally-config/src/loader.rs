use std::path::{Path, PathBuf};

use tally_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_ENV: &str = "TALLY_CONFIG";
const DB_PATH_ENV: &str = "TALLY_DB_PATH";
const LOG_FORMAT_ENV: &str = "TALLY_LOG_FORMAT";

/// Resolves and reads the tally configuration file.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Default location: `$TALLY_CONFIG`, else `~/.tally/config.yml`.
    pub fn default_path() -> PathBuf {
        if let Some(path) = env_value(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tally")
            .join("config.yml")
    }

    /// Load `path` (or the default location) and apply environment overrides.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        let mut config = if path.exists() {
            info!("loading config from {}", path.display());
            Self::from_file(&path)?
        } else {
            debug!("no config at {}, using defaults", path.display());
            AppConfig::default()
        };
        Self::apply_env(&mut config)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
            "toml" => {
                toml::from_str(&contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
            }
            other => Err(Error::Config(format!("unsupported config extension: {other}"))),
        }
    }

    fn apply_env(config: &mut AppConfig) -> Result<()> {
        if let Some(path) = env_value(DB_PATH_ENV) {
            config.database.path = PathBuf::from(path);
        }
        if let Some(format) = env_value(LOG_FORMAT_ENV) {
            config.log.format = format.parse().map_err(Error::Config)?;
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
