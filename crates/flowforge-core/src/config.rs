use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::graph::MediaFamily;

/// Config file looked up in the working directory before the home fallback.
pub const LOCAL_CONFIG_FILE: &str = "flowforge.toml";

/// Top-level FlowForge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on handlers running at once within one run.
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,
    /// Per-handler wall-clock limit.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: default_max_concurrent_nodes(),
            node_timeout_secs: default_node_timeout_secs(),
        }
    }
}

fn default_max_concurrent_nodes() -> usize { 8 }
fn default_node_timeout_secs() -> u64 { 600 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.flowforge/flowforge.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:7410".to_string() }

/// One backend section per generation family. Absent sections leave the
/// family without a handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub text: Option<BackendConfig>,
    #[serde(default)]
    pub image: Option<BackendConfig>,
    #[serde(default)]
    pub video: Option<BackendConfig>,
    #[serde(default)]
    pub audio: Option<BackendConfig>,
}

impl BackendsConfig {
    pub fn get(&self, family: MediaFamily) -> Option<&BackendConfig> {
        match family {
            MediaFamily::Text => self.text.as_ref(),
            MediaFamily::Image => self.image.as_ref(),
            MediaFamily::Video => self.video.as_ref(),
            MediaFamily::Audio => self.audio.as_ref(),
        }
    }

    /// Configured families with their sections.
    pub fn configured(&self) -> impl Iterator<Item = (MediaFamily, &BackendConfig)> {
        MediaFamily::ALL
            .into_iter()
            .filter_map(move |f| self.get(f).map(|c| (f, c)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendProvider {
    #[default]
    Http,
    Echo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub provider: BackendProvider,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl BackendConfig {
    pub fn echo() -> Self {
        Self {
            provider: BackendProvider::Echo,
            base_url: None,
            api_key: None,
            model: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_wait_secs: default_max_wait_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn http(base_url: impl Into<String>) -> Self {
        Self {
            provider: BackendProvider::Http,
            base_url: Some(base_url.into()),
            ..Self::echo()
        }
    }
}

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_max_wait_secs() -> u64 { 600 }
fn default_request_timeout_secs() -> u64 { 60 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse TOML text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Find the config file: explicit path, then `./flowforge.toml`, then
    /// `~/.flowforge/config.toml`.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        let home = dirs_home()?.join(".flowforge").join("config.toml");
        home.exists().then_some(home)
    }

    /// Load from the located file, or defaults when none exists.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match Self::locate(explicit) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Resolve the store path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    fn check(&self) -> Result<()> {
        if self.engine.max_concurrent_nodes == 0 {
            return Err(FlowError::Config(
                "engine.max_concurrent_nodes must be at least 1".into(),
            ));
        }
        for (family, backend) in self.backends.configured() {
            if backend.provider == BackendProvider::Http && backend.base_url.is_none() {
                return Err(FlowError::Config(format!(
                    "backends.{} uses the http provider but has no base_url",
                    family.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FLOWFORGE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FLOWFORGE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FLOWFORGE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FLOWFORGE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FLOWFORGE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.engine.max_concurrent_nodes, 8);
        assert_eq!(config.engine.node_timeout_secs, 600);
        assert_eq!(config.gateway.bind, "127.0.0.1:7410");
        assert_eq!(config.store.path, "~/.flowforge/flowforge.db");
        assert_eq!(config.backends.configured().count(), 0);
    }

    #[test]
    fn test_backend_sections() {
        let config = AppConfig::parse(
            r#"
[backends.image]
base_url = "http://localhost:9000"
api_key = "sk-img"
max_wait_secs = 30

[backends.text]
provider = "echo"
"#,
        )
        .unwrap();
        let image = config.backends.get(MediaFamily::Image).unwrap();
        assert_eq!(image.provider, BackendProvider::Http);
        assert_eq!(image.max_wait_secs, 30);
        assert_eq!(image.poll_interval_ms, 1000);
        assert_eq!(image.request_timeout_secs, 60);
        let text = config.backends.get(MediaFamily::Text).unwrap();
        assert_eq!(text.provider, BackendProvider::Echo);
        assert!(config.backends.get(MediaFamily::Video).is_none());
    }

    #[test]
    fn test_http_backend_requires_base_url() {
        let err = AppConfig::parse("[backends.video]\nprovider = \"http\"\n").unwrap_err();
        assert!(err.to_string().contains("backends.video"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowforge.toml");
        std::fs::write(&path, "[engine]\nnode_timeout_secs = 5\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.engine.node_timeout_secs, 5);

        let missing = AppConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, FlowError::ConfigNotFound(_)));
        assert_eq!(AppConfig::locate(Some(&path)), Some(path.clone()));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(AppConfig::parse("[engine]\nmax_concurrent_nodes = 0\n").is_err());
    }

    #[test]
    fn test_expand_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(
            expand_home("~/.flowforge/x.db"),
            PathBuf::from("/home/tester/.flowforge/x.db")
        );
        assert_eq!(expand_home("/abs/x.db"), PathBuf::from("/abs/x.db"));
    }
}
