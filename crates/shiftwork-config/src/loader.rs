//! Configuration loader.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::ConfigError;
use crate::schema::Config;

/// Configuration loader with environment variable substitution.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a string.
    pub fn load_str(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Load `path` if given, else the first existing default location, else
    /// the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_paths().into_iter().find(|p| p.exists()) {
                Some(found) => Self::load(&found),
                None => Ok(Config::default()),
            },
        }
    }

    /// `./shiftwork.toml`, then `<config dir>/shiftwork/config.toml`.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("shiftwork.toml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("shiftwork").join("config.toml"));
        }
        paths
    }

    /// Expand `${VAR}` and `${VAR:-default}`.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;

        let mut result = String::with_capacity(content.len());
        let mut last = 0;
        for cap in re.captures_iter(content) {
            let Some(whole) = cap.get(0) else { continue };
            let var_name = &cap[1];
            let value = match (std::env::var(var_name), cap.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.as_str().to_string(),
                (Err(_), None) => return Err(ConfigError::EnvVarNotSet(var_name.to_string())),
            };
            result.push_str(&content[last..whole.start()]);
            result.push_str(&value);
            last = whole.end();
        }
        result.push_str(&content[last..]);

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.shiftwork`).
    pub fn expand_path(path: &str) -> String {
        shellexpand::tilde(path).to_string()
    }
}
