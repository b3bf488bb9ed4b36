use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HostConfig {
    /// Base under which kernel channel endpoints are addressed.
    pub base_url: String,
    /// Kernel type used when a start request names none. Must be registered;
    /// otherwise the first registered type stays the default.
    pub default_kernel: Option<String>,
}

impl HostConfig {
    /// Load from the config file, falling back to defaults when absent.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("KERNELHUB_CONFIG") {
            return PathBuf::from(path);
        }
        dirs_path().join("config.toml")
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            base_url: "local://hub".to_string(),
            default_kernel: None,
        }
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("kernelhub")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("kernelhub")
    } else {
        PathBuf::from("/tmp/kernelhub")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file() {
        let config = HostConfig::default();
        assert_eq!(config.base_url, "local://hub");
        assert!(config.default_kernel.is_none());
    }

    #[test]
    fn parses_partial_toml() {
        let config: HostConfig = toml::from_str("default_kernel = \"echo\"").unwrap();
        assert_eq!(config.base_url, "local://hub");
        assert_eq!(config.default_kernel.as_deref(), Some("echo"));
    }
}
