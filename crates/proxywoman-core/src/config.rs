use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const CONFIG_FILE: &str = "config.json";

/// Application configuration persisted as `config.json` in the config
/// directory. A missing file yields the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub proxy_port: u16,
    #[serde(skip)]
    pub config_dir: PathBuf,
    pub auto_start: bool,
    pub theme: String,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy_port: 8080,
            config_dir: PathBuf::new(),
            auto_start: false,
            theme: "dark".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Self, CoreError> {
        let config_dir = config_dir.as_ref();
        let config_path = config_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            let mut config = Self::default();
            config.config_dir = config_dir.to_path_buf();
            return Ok(config);
        }

        let data = fs::read_to_string(&config_path)?;
        let mut config: Self = serde_json::from_str(&data)?;
        config.config_dir = config_dir.to_path_buf();
        Ok(config)
    }

    pub fn save(&self) -> Result<(), CoreError> {
        fs::create_dir_all(&self.config_dir)?;
        let data = serde_json::to_string_pretty(self)?;
        fs::write(self.config_dir.join(CONFIG_FILE), data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AppConfig::load(dir.path()).expect("load defaults");
        assert_eq!(config.proxy_port, 8080);
        assert_eq!(config.theme, "dark");
        assert_eq!(config.log_level, "info");
        assert!(!config.auto_start);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::load(dir.path()).expect("load defaults");
        config.proxy_port = 9999;
        config.theme = "light".to_string();
        config.save().expect("save");

        let reloaded = AppConfig::load(dir.path()).expect("reload");
        assert_eq!(reloaded.proxy_port, 9999);
        assert_eq!(reloaded.theme, "light");
    }

    #[test]
    fn unknown_fields_do_not_break_loading() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"proxyPort": 1234, "futureSetting": true}"#,
        )
        .expect("write config");
        let config = AppConfig::load(dir.path()).expect("load");
        assert_eq!(config.proxy_port, 1234);
    }
}
