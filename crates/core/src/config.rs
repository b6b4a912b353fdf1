//! TOML-based configuration for ScenarioSync.
//!
//! Secrets (the optional bootstrap git token) are stored as `_env` fields
//! that name environment variables. The actual values are resolved at
//! runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Process-level settings (logging, data directory).
    #[serde(default)]
    pub server: ServerConfig,

    /// HTTP API settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Git remote settings.
    pub git: GitConfig,

    /// Merge coordinator settings.
    #[serde(default)]
    pub merge: MergeConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (database, git mirror).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Optional log file; output rolls daily when set.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/scenariosync")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            log_file: None,
        }
    }
}

impl ServerConfig {
    /// Path of the SQLite database inside `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("scenariosync.db")
    }

    /// Path of the bare git mirror inside `data_dir`.
    pub fn git_mirror_path(&self) -> PathBuf {
        self.data_dir.join("git-repo")
    }
}

// ---------------------------------------------------------------------------
// Web
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen address (default `127.0.0.1:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:3000".into()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Git remote configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// URL of the remote repository that backs scenario state.
    pub repository_url: String,

    /// Branch that holds the root baseline (default `main`).
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Provider label stored with credentials.
    #[serde(default = "default_credential_provider")]
    pub credential_provider: String,

    /// Remote name in the local mirror.
    #[serde(default = "default_remote_name")]
    pub remote_name: String,

    /// Timeout applied to every network leg of a sync operation.
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u64,

    /// Domain used to build commit author emails from user ids.
    #[serde(default = "default_email_domain")]
    pub author_email_domain: String,

    /// Environment variable holding a token seeded as the `system`
    /// credential at daemon start.
    #[serde(default)]
    pub token_env: Option<String>,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_branch() -> String {
    "main".into()
}
fn default_credential_provider() -> String {
    "github-enterprise".into()
}
fn default_remote_name() -> String {
    "origin".into()
}
fn default_network_timeout() -> u64 {
    30
}
fn default_email_domain() -> String {
    "scenariosync.local".into()
}

impl GitConfig {
    /// A config pointing at `repository_url` with every other field defaulted.
    pub fn for_url(repository_url: impl Into<String>) -> Self {
        Self {
            repository_url: repository_url.into(),
            default_branch: default_branch(),
            credential_provider: default_credential_provider(),
            remote_name: default_remote_name(),
            network_timeout_secs: default_network_timeout(),
            author_email_domain: default_email_domain(),
            token_env: None,
            token: None,
        }
    }

    pub fn author_email(&self, user_id: &str) -> String {
        format!("{}@{}", user_id, self.author_email_domain)
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Age after which a scenario lock is considered abandoned by a crashed
    /// worker and may be reclaimed.
    #[serde(default = "default_lock_stale")]
    pub lock_stale_after_secs: u64,

    /// Upper bound for ancestor walks.
    #[serde(default = "default_max_depth")]
    pub max_hierarchy_depth: usize,
}

fn default_lock_stale() -> u64 {
    900
}
fn default_max_depth() -> usize {
    64
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            lock_stale_after_secs: default_lock_stale(),
            max_hierarchy_depth: default_max_depth(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// A missing variable logs a warning and leaves the value unset.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.git.token_env {
            self.git.token = resolve_optional_env(env_name, "git.token_env");
        }
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.git.repository_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "git.repository_url".into(),
                detail: "repository URL must not be empty".into(),
            });
        }
        if self.git.default_branch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "git.default_branch".into(),
                detail: "default branch must not be empty".into(),
            });
        }
        if self.git.network_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "git.network_timeout_secs".into(),
                detail: "network timeout must be > 0".into(),
            });
        }
        if self.merge.max_hierarchy_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "merge.max_hierarchy_depth".into(),
                detail: "hierarchy depth must be > 0".into(),
            });
        }
        if self.merge.lock_stale_after_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "merge.lock_stale_after_secs".into(),
                detail: "lock staleness must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Commented default configuration written by `scenariosync init`.
    pub fn default_toml() -> &'static str {
        DEFAULT_CONFIG
    }
}

const DEFAULT_CONFIG: &str = r#"# ScenarioSync configuration

[server]
log_level = "info"
data_dir = "/var/lib/scenariosync"
# log_file = "/var/log/scenariosync/server.log"

[web]
listen = "127.0.0.1:3000"

[git]
repository_url = "https://github.example.com/planning/capacity.git"
default_branch = "main"
credential_provider = "github-enterprise"
remote_name = "origin"
network_timeout_secs = 30
author_email_domain = "scenariosync.local"
# token_env = "SCENARIOSYNC_GIT_TOKEN"

[merge]
lock_stale_after_secs = 900
max_hierarchy_depth = 64
"#;

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[server]
log_level = "debug"
data_dir = "/tmp/scenariosync"

[web]
listen = "0.0.0.0:8080"

[git]
repository_url = "https://git.example.com/plan.git"
default_branch = "trunk"
network_timeout_secs = 5
token_env = "SCENARIOSYNC_TEST_TOKEN_A"

[merge]
lock_stale_after_secs = 60
max_hierarchy_depth = 8
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.web.listen, "0.0.0.0:8080");
        assert_eq!(config.git.default_branch, "trunk");
        assert_eq!(config.git.network_timeout_secs, 5);
        assert_eq!(config.merge.max_hierarchy_depth, 8);
        assert_eq!(
            config.server.database_path(),
            PathBuf::from("/tmp/scenariosync/scenariosync.db")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.git.repository_url, "https://git.example.com/plan.git");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_empty_url() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.git.repository_url = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "git.repository_url"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_timeout_and_depth() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.git.network_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.merge.max_hierarchy_depth = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "merge.max_hierarchy_depth"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("SCENARIOSYNC_TEST_TOKEN_A", "ghp_abc");
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(config.git.token.as_deref(), Some("ghp_abc"));
        std::env::remove_var("SCENARIOSYNC_TEST_TOKEN_A");
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[git]
repository_url = "https://git.example.com/plan.git"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.web.listen, "127.0.0.1:3000");
        assert_eq!(config.git.default_branch, "main");
        assert_eq!(config.git.credential_provider, "github-enterprise");
        assert_eq!(config.merge.lock_stale_after_secs, 900);
        assert!(config.git.token.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_default_toml_is_valid() {
        let config: AppConfig = toml::from_str(AppConfig::default_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.git.author_email("alice"), "alice@scenariosync.local");
    }
}
