use crate::error::ConfigError;
use serde::Deserialize;
use std::path::PathBuf;

/// Number of times a build transaction is attempted before giving up on
/// serialization failures.
pub const DEFAULT_MAX_BUILD_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_max_build_attempts")]
    pub max_build_attempts: u32,
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("FORGE_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("forge").join("forge.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".forge").join("forge.db")
    }
}

fn default_max_connections() -> u32 {
    std::env::var("FORGE_DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5)
}

fn default_busy_timeout_ms() -> u64 {
    std::env::var("FORGE_DB_BUSY_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5000)
}

fn default_max_build_attempts() -> u32 {
    std::env::var("FORGE_MAX_BUILD_ATTEMPTS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_MAX_BUILD_ATTEMPTS)
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_build_attempts: default_max_build_attempts(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Parse a YAML document; missing keys fall back to the environment defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_build_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_build_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = OrchestratorConfig::from_yaml_str(
            "db_path: /var/lib/forge/forge.db\nmax_build_attempts: 3\n",
        )
        .expect("valid config");

        assert_eq!(config.db_path, PathBuf::from("/var/lib/forge/forge.db"));
        assert_eq!(config.max_build_attempts, 3);
        assert!(config.max_connections >= 1);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = OrchestratorConfig::from_yaml_str("max_build_attempts: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        let result = OrchestratorConfig::from_yaml_str("max_build_attempts: [nope");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
