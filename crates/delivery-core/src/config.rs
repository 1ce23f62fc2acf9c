//! Configuration parsing for the delivery daemon.
//!
//! Key=value format read from `.delivery/config`.
//! Precedence: CLI flags > `--config` file > `.delivery/config` > defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::marker::TOMCAT_STARTED_PATTERN;
use crate::types::DeployMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Pipeline, tooling and collaborator settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Built-in pipeline template to run for every push.
    pub pipeline: String,

    // Directories
    pub log_dir: PathBuf,
    pub checkout_dir: PathBuf,
    pub artifact_dir: PathBuf,

    // Links
    /// Scheme and host deployed endpoints are reachable at (no port).
    pub base_url: String,
    /// Base URL progress logs are linked under.
    pub log_base_url: String,

    // Local deployment
    pub lower_port: u16,
    pub deploy_mode: DeployMode,
    pub startup_marker: String,
    pub team: String,
    pub deploy_startup_timeout_sec: u32,
    pub terminate_timeout_sec: u32,

    // Build
    pub build_timeout_sec: u32,
    pub clone_url_template: String,

    // Stage commands
    /// Pipe-separated scan commands; all must exit 0.
    pub scan_cmds: Vec<String>,
    /// Pipe-separated reviewer commands; any output line is a finding.
    pub review_cmds: Vec<String>,
    pub promote_cmd: Option<String>,

    // Endpoint verification
    pub verify_retries: u32,
    pub verify_interval_sec: u32,

    // Reporting
    pub status_timeout_sec: u32,
    pub retry_enabled: bool,
    pub notify_webhook: Option<String>,
    /// Feed reported statuses back into the dispatcher.
    pub loopback_events: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .map_or_else(|| PathBuf::from(".local/share/deliveryd"), |d| d.join("deliveryd"));
        Self {
            pipeline: "http_service".to_string(),
            log_dir: data_dir.join("logs"),
            checkout_dir: data_dir.join("checkouts"),
            artifact_dir: data_dir.join("artifacts"),
            base_url: "http://127.0.0.1".to_string(),
            log_base_url: "http://127.0.0.1:7800".to_string(),
            lower_port: 8080,
            deploy_mode: DeployMode::Jar,
            startup_marker: TOMCAT_STARTED_PATTERN.to_string(),
            team: "local".to_string(),
            deploy_startup_timeout_sec: 300,
            terminate_timeout_sec: 10,
            build_timeout_sec: 1800,
            clone_url_template: "https://github.com/{owner}/{repo}.git".to_string(),
            scan_cmds: Vec::new(),
            review_cmds: Vec::new(),
            promote_cmd: None,
            verify_retries: 10,
            verify_interval_sec: 3,
            status_timeout_sec: 10,
            retry_enabled: true,
            notify_webhook: None,
            loopback_events: true,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let value = Self::unquote(value.trim());
            self.apply_value(key.trim(), &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "pipeline" => self.pipeline = value.to_string(),
            "log_dir" => self.log_dir = PathBuf::from(value),
            "checkout_dir" => self.checkout_dir = PathBuf::from(value),
            "artifact_dir" => self.artifact_dir = PathBuf::from(value),
            "base_url" => self.base_url = value.trim_end_matches('/').to_string(),
            "log_base_url" => self.log_base_url = value.trim_end_matches('/').to_string(),
            "lower_port" => self.lower_port = Self::parse_int(key, value)?,
            "deploy_mode" => {
                self.deploy_mode = match value {
                    "jar" => DeployMode::Jar,
                    "source" => DeployMode::Source,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "deploy_mode must be 'jar' or 'source', got '{value}'"
                        )))
                    }
                }
            }
            "startup_marker" => self.startup_marker = value.to_string(),
            "team" => self.team = value.to_string(),
            "deploy_startup_timeout_sec" => {
                self.deploy_startup_timeout_sec = Self::parse_int(key, value)?;
            }
            "terminate_timeout_sec" => self.terminate_timeout_sec = Self::parse_int(key, value)?,
            "build_timeout_sec" => self.build_timeout_sec = Self::parse_int(key, value)?,
            "clone_url_template" => self.clone_url_template = value.to_string(),
            "scan_cmds" => self.scan_cmds = Self::split_commands(value),
            "review_cmds" => self.review_cmds = Self::split_commands(value),
            "promote_cmd" => {
                self.promote_cmd = (!value.is_empty()).then(|| value.to_string());
            }
            "verify_retries" => self.verify_retries = Self::parse_int(key, value)?,
            "verify_interval_sec" => self.verify_interval_sec = Self::parse_int(key, value)?,
            "status_timeout_sec" => self.status_timeout_sec = Self::parse_int(key, value)?,
            "retry_enabled" => self.retry_enabled = Self::parse_bool(key, value)?,
            "notify_webhook" => {
                self.notify_webhook = (!value.is_empty()).then(|| value.to_string());
            }
            "loopback_events" => self.loopback_events = Self::parse_bool(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Pipe-separated list of commands.
    fn split_commands(value: &str) -> Vec<String> {
        value
            .split('|')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative directories against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        for dir in [&mut self.log_dir, &mut self.checkout_dir, &mut self.artifact_dir] {
            if dir.is_relative() {
                *dir = workspace_root.join(&*dir);
            }
        }
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.terminate_timeout_sec))
    }

    pub fn deploy_startup_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.deploy_startup_timeout_sec))
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.build_timeout_sec))
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.status_timeout_sec))
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.verify_interval_sec))
    }
}
