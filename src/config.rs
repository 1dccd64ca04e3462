use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub engine: EngineSettings,
    pub recording: RecordingConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    // Store root; defaults to the config directory (~/.redterm)
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSettings {
    pub shell: String,
    pub poll_interval_ms: u64,
    pub grace_period_ms: u64,
    pub read_chunk_size: usize,
    pub default_timeout_secs: u64,
    pub interactive_programs: Vec<String>,
    // Substring of the lower-cased command -> budget in seconds
    pub timeouts: BTreeMap<String, u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let timeouts = [
            ("nmap", 7200),
            ("sqlmap", 7200),
            ("gobuster", 3600),
            ("nikto", 3600),
            ("hydra", 3600),
            ("masscan", 3600),
            ("enum4linux", 1800),
            ("dirb", 1800),
            ("dirbuster", 1800),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let interactive_programs = [
            "ssh", "ftp", "telnet", "mysql", "psql", "sqlmap", "msfconsole", "gdb", "vim", "nano",
            "less", "more", "python", "python3", "ruby", "perl", "bash", "sh", "nc -", "ncat",
            "socat",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self {
            shell: "/bin/sh".to_string(),
            poll_interval_ms: 100,
            grace_period_ms: 2000,
            read_chunk_size: 1024,
            default_timeout_secs: 60,
            interactive_programs,
            timeouts,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RecordingConfig {
    // Write an asciicast v2 file next to every saved recording
    pub export_cast: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self { export_cast: true }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayConfig {
    pub language: String,
    pub show_sanitized: bool,
    pub log_limit: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            language: "auto".to_string(),
            show_sanitized: true,
            log_limit: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(config_dir) = path.parent() {
            fs::create_dir_all(config_dir)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Directory holding config.toml, and the store unless `storage.base_dir` is set.
    pub fn home_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("REDTERM_HOME") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".redterm")
    }

    fn get_config_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.storage
            .base_dir
            .clone()
            .unwrap_or_else(Self::home_dir)
    }

    pub fn get_effective_language(&self) -> String {
        if self.display.language == "auto" {
            // Try to get system language
            std::env::var("LANG")
                .unwrap_or_else(|_| "en_US".to_string())
                .split('.')
                .next()
                .unwrap_or("en")
                .to_string()
        } else {
            self.display.language.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[engine]\npoll_interval_ms = 50\n\n[engine.timeouts]\nferoxbuster = 900\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.engine.poll_interval_ms, 50);
        assert_eq!(config.engine.shell, "/bin/sh");
        assert_eq!(config.engine.timeouts.get("feroxbuster"), Some(&900));
        // A user-supplied table replaces the built-in one
        assert!(config.engine.timeouts.get("nmap").is_none());
        assert!(config.recording.export_cast);
        assert_eq!(config.display.log_limit, 5);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.display.language = "zh".to_string();
        config.engine.grace_period_ms = 500;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.display.language, "zh");
        assert_eq!(loaded.engine.grace_period_ms, 500);
        assert_eq!(loaded.engine.timeouts.get("nmap"), Some(&7200));
    }

    #[test]
    fn explicit_language_wins_over_env() {
        let mut config = Config::default();
        config.display.language = "en".to_string();
        assert_eq!(config.get_effective_language(), "en");
    }
}
