//! Runtime configuration
//!
//! A small JSON file next to the store. Missing files and unknown keys are
//! tolerated; a broken file falls back to defaults with a logged warning.

use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the filter store; the working directory if unset.
    pub db_directory: Option<PathBuf>,
    pub db_file: String,
    pub subscriptions_autoupdate: bool,
    /// Whether filter hit statistics are collected and persisted.
    pub save_stats: bool,
    pub app: String,
    pub app_version: String,
    /// Update manifest location; `%TYPE%` marks the manual/automatic slot.
    pub update_url: String,
    pub update_last_error: u64,
    pub update_last_check: u64,
    pub update_soft_expiration: u64,
    pub update_hard_expiration: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_directory: None,
            db_file: "patterns.ini".to_string(),
            subscriptions_autoupdate: true,
            save_stats: true,
            app: "listkeeper".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            update_url: String::new(),
            update_last_error: 0,
            update_last_check: 0,
            update_soft_expiration: 0,
            update_hard_expiration: 0,
        }
    }
}

impl Config {
    /// Load from a JSON file, falling back to defaults on any problem.
    pub fn load(path: &Path) -> Config {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("failed to read {}: {err}", path.display());
                }
                return Config::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(config) => config,
            Err(err) => {
                warn!("failed to parse {}: {err}", path.display());
                Config::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let text = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Location of the filter store.
    pub fn db_path(&self) -> PathBuf {
        match &self.db_directory {
            Some(directory) => directory.join(&self.db_file),
            None => PathBuf::from(&self.db_file),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_unknown_keys() {
        let parsed: Config = serde_json::from_str(
            r#"{"db_file": "custom.ini", "novel_key": 7, "subscriptions_autoupdate": false}"#,
        )
        .unwrap();
        assert_eq!(parsed.db_file, "custom.ini");
        assert!(!parsed.subscriptions_autoupdate);
        assert!(parsed.save_stats);
        assert_eq!(parsed.db_path(), PathBuf::from("custom.ini"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load(Path::new("/nonexistent/listkeeper.json"));
        assert_eq!(config.db_file, "patterns.ini");
        assert!(config.subscriptions_autoupdate);
    }

    #[test]
    fn test_db_path_with_directory() {
        let config = Config { db_directory: Some(PathBuf::from("/var/lib/lk")), ..Config::default() };
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/lk/patterns.ini"));
    }
}
