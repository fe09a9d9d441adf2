use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ToolError;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub graph: GraphConfig,
    pub files: FilesConfig,
    pub features: FeaturesConfig,
    pub reply: ReplyConfig,
    pub logging: LoggingConfig,
    /// File the settings were read from; `None` when defaults were used.
    #[serde(skip)]
    pub loaded_from: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphConfig {
    pub base_url: String,
    pub resource: String,
    pub credential_command: String,
    pub default_scopes: Vec<String>,
    pub token_ttl_secs: u64,
    pub request_timeout_secs: u64,
    /// Attachment downloads can be large, so they get their own limit.
    pub download_timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.microsoft.com/v1.0".to_string(),
            resource: "https://graph.microsoft.com".to_string(),
            credential_command: "m365".to_string(),
            default_scopes: Vec::new(),
            token_ttl_secs: crate::auth::DEFAULT_TOKEN_TTL.as_secs(),
            request_timeout_secs: 60,
            download_timeout_secs: 300,
        }
    }
}

impl GraphConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FilesConfig {
    /// Base directory for relative attachment targets.
    pub sandbox_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeaturesConfig {
    pub enable_mail: bool,
    pub enable_calendar: bool,
    pub validate_inputs: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            enable_mail: true,
            enable_calendar: true,
            validate_inputs: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ReplyConfig {
    /// When set, replies are sent as new messages to this address instead.
    pub redirect_to: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load the file if present, fall back to defaults, then apply
    /// environment overrides. Runs before logging is set up, so it does not
    /// log; `loaded_from` records which case applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let mut config = Self::from_file(path)?;
            config.loaded_from = Some(path.to_path_buf());
            config
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override settings from environment-style variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(command) = lookup("GRAPH_CREDENTIAL_COMMAND") {
            self.graph.credential_command = command;
        }
        if let Some(scopes) = lookup("GRAPH_DEFAULT_SCOPES") {
            self.graph.default_scopes = scopes
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(root) = lookup("GRAPH_FILES_ROOT") {
            self.files.sandbox_root = Some(PathBuf::from(root)).filter(|p| !p.as_os_str().is_empty());
        }
        if let Some(flag) = lookup("GRAPH_ENABLE_MAIL") {
            self.features.enable_mail = parse_flag("GRAPH_ENABLE_MAIL", &flag)?;
        }
        if let Some(flag) = lookup("GRAPH_ENABLE_CALENDAR") {
            self.features.enable_calendar = parse_flag("GRAPH_ENABLE_CALENDAR", &flag)?;
        }
        if let Some(flag) = lookup("GRAPH_VALIDATE_INPUTS") {
            self.features.validate_inputs = parse_flag("GRAPH_VALIDATE_INPUTS", &flag)?;
        }
        if let Some(address) = lookup("GRAPH_REPLY_REDIRECT_TO") {
            self.reply.redirect_to = Some(address).filter(|a| !a.trim().is_empty());
        }
        if let Some(secs) = lookup("GRAPH_REQUEST_TIMEOUT_SECS") {
            self.graph.request_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("GRAPH_REQUEST_TIMEOUT_SECS is not a number: {secs}"))?;
        }
        Ok(())
    }

    /// Reject settings the server cannot start with.
    pub fn validate(&self) -> Result<(), ToolError> {
        if self.graph.credential_command.trim().is_empty() {
            return Err(ToolError::Configuration(
                "graph.credential_command must not be empty".to_string(),
            ));
        }
        match reqwest::Url::parse(&self.graph.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(ToolError::Configuration(format!(
                    "graph.base_url is not an absolute http(s) URL: {}",
                    self.graph.base_url
                )))
            }
        }
        if self.graph.request_timeout_secs == 0 {
            return Err(ToolError::Configuration(
                "graph.request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.graph.download_timeout_secs == 0 {
            return Err(ToolError::Configuration(
                "graph.download_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(root) = &self.files.sandbox_root {
            if !root.is_absolute() {
                return Err(ToolError::Configuration(format!(
                    "files.sandbox_root must be an absolute path: {}",
                    root.display()
                )));
            }
        }
        if let Some(address) = &self.reply.redirect_to {
            if !address.contains('@') {
                return Err(ToolError::Configuration(format!(
                    "reply.redirect_to is not an email address: {address}"
                )));
            }
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{name} must be a boolean, got '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_parsing() {
        let toml_str = r#"
            [graph]
            credential_command = "m365.cmd"
            default_scopes = ["Mail.Read"]
            token_ttl_secs = 120

            [files]
            sandbox_root = "/srv/attachments"

            [features]
            enable_calendar = false

            [reply]
            redirect_to = "claims@example.com"

            [logging]
            level = "debug"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.graph.credential_command, "m365.cmd");
        assert_eq!(config.graph.base_url, "https://graph.microsoft.com/v1.0");
        assert_eq!(config.graph.token_ttl(), Duration::from_secs(120));
        assert_eq!(config.files.sandbox_root, Some(PathBuf::from("/srv/attachments")));
        assert!(config.features.enable_mail);
        assert!(!config.features.enable_calendar);
        assert!(config.features.validate_inputs);
        assert_eq!(config.reply.redirect_to.as_deref(), Some("claims@example.com"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.graph.credential_command, "m365");
        assert_eq!(config.graph.token_ttl(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GRAPH_CREDENTIAL_COMMAND", "cli-m365"),
            ("GRAPH_DEFAULT_SCOPES", "Mail.Read, Calendars.Read"),
            ("GRAPH_ENABLE_MAIL", "false"),
            ("GRAPH_REPLY_REDIRECT_TO", "inbox@example.com"),
            ("GRAPH_REQUEST_TIMEOUT_SECS", "15"),
        ]);
        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.graph.credential_command, "cli-m365");
        assert_eq!(config.graph.default_scopes, vec!["Mail.Read", "Calendars.Read"]);
        assert!(!config.features.enable_mail);
        assert_eq!(config.reply.redirect_to.as_deref(), Some("inbox@example.com"));
        assert_eq!(config.graph.request_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_bad_flag_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "GRAPH_ENABLE_CALENDAR").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("GRAPH_ENABLE_CALENDAR"));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.graph.credential_command = " ".to_string();
        assert!(matches!(config.validate(), Err(ToolError::Configuration(_))));

        let mut config = Config::default();
        config.graph.base_url = "graph/v1.0".to_string();
        assert!(matches!(config.validate(), Err(ToolError::Configuration(_))));

        let mut config = Config::default();
        config.files.sandbox_root = Some(PathBuf::from("relative/dir"));
        assert!(matches!(config.validate(), Err(ToolError::Configuration(_))));

        let mut config = Config::default();
        config.graph.download_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ToolError::Configuration(_))));

        let mut config = Config::default();
        config.reply.redirect_to = Some("nobody".to_string());
        assert!(matches!(config.validate(), Err(ToolError::Configuration(_))));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert!(config.features.enable_mail);
        assert!(config.loaded_from.is_none());
        assert_eq!(config.graph.download_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_load_records_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[graph]\ndownload_timeout_secs = 30\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.loaded_from.as_deref(), Some(path.as_path()));
        assert_eq!(config.graph.download_timeout(), Duration::from_secs(30));
    }
}
