//! Agent Configuration
//!
//! Settings are layered with the `config` crate: built-in defaults, an optional
//! TOML file named by `AGENT_CONFIG_FILE`, then `AGENT_*` environment variables.
//!
//! Call `load_environment()` early in main() so that variables from the
//! canonical environment file are visible to the loader:
//!
//! ```no_run
//! use lake_core::config::{load_environment, AgentConfig};
//!
//! load_environment();
//! let config = AgentConfig::load().expect("invalid agent configuration");
//! ```

use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default path for the environment file
pub const DEFAULT_ENV_FILE: &str = "/etc/lake-agent/environment";

/// Environment files to check (in order of priority)
pub const ENV_FILE_PATHS: &[&str] = &["/etc/lake-agent/environment", ".env"];

/// Prefix for environment overrides (`AGENT_TOKEN`, `AGENT_LISTEN_ADDR`, ...)
pub const ENV_PREFIX: &str = "AGENT";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

/// Compute agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Shared secret required on every route
    pub token: String,
    /// Bind address (host:port)
    pub listen_addr: String,
    /// Engine database file
    pub database_path: PathBuf,
    /// Directory holding per-job scratch result storage
    pub scratch_dir: PathBuf,
    /// Engine heap limit in GiB (0 = unlimited)
    pub max_memory_gb: u32,
    /// Per-query deadline
    pub query_timeout_secs: u64,
    /// Row ceiling for synchronous execution
    pub max_result_rows: usize,
    /// Admission limiter capacity
    pub max_concurrent_queries: usize,
    /// How long terminal jobs are retained
    pub result_ttl_secs: u64,
    /// Minimum spacing between eviction sweeps
    pub cleanup_interval_secs: u64,
    /// Default FetchResults page size
    pub default_page_size: usize,
    /// FetchResults page size ceiling
    pub max_page_size: usize,
    /// Mount the asynchronous /queries routes
    pub query_lifecycle_enabled: bool,
    /// Deployment environment name
    pub env: String,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    /// Permit plain HTTP in production
    pub allow_insecure_http: bool,
    pub log_format: LogFormat,
}

impl AgentConfig {
    /// Load from defaults, `AGENT_CONFIG_FILE` and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var("AGENT_CONFIG_FILE").ok().filter(|v| !v.is_empty());
        Self::from_sources(file.as_deref(), None)
    }

    /// Load with an explicit file and environment map.
    ///
    /// `env` replaces the process environment when given; keys carry the
    /// `AGENT_` prefix exactly as they would in the environment.
    pub fn from_sources(
        file: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("listen_addr", "0.0.0.0:9443")?
            .set_default("database_path", "lake-agent.db")?
            .set_default("scratch_dir", "lake-agent-scratch")?
            .set_default("max_memory_gb", 0)?
            .set_default("query_timeout_secs", 120)?
            .set_default("max_result_rows", 10_000)?
            .set_default("max_concurrent_queries", 8)?
            .set_default("result_ttl_secs", 600)?
            .set_default("cleanup_interval_secs", 60)?
            .set_default("default_page_size", 1000)?
            .set_default("max_page_size", 5000)?
            .set_default("query_lifecycle_enabled", true)?
            .set_default("env", "development")?
            .set_default("allow_insecure_http", false)?
            .set_default("log_format", "compact")?;

        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(env);

        let mut config: AgentConfig = builder.add_source(environment).build()?.try_deserialize()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.tls_cert_file = self.tls_cert_file.take().filter(|v| !v.trim().is_empty());
        self.tls_key_file = self.tls_key_file.take().filter(|v| !v.trim().is_empty());
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::Invalid("AGENT_TOKEN is required".into()));
        }
        if self.max_concurrent_queries == 0 {
            return Err(ConfigError::Invalid("max_concurrent_queries must be positive".into()));
        }
        if self.max_result_rows == 0 {
            return Err(ConfigError::Invalid("max_result_rows must be positive".into()));
        }
        if self.query_timeout_secs == 0 {
            return Err(ConfigError::Invalid("query_timeout_secs must be positive".into()));
        }
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(ConfigError::Invalid("page sizes must be positive".into()));
        }
        if self.default_page_size > self.max_page_size {
            return Err(ConfigError::Invalid(format!(
                "default_page_size ({}) exceeds max_page_size ({})",
                self.default_page_size, self.max_page_size
            )));
        }
        if scratch_holds_database(&self.scratch_dir, &self.database_path) {
            return Err(ConfigError::Invalid(format!(
                "scratch_dir ({}) must not be the directory holding database_path ({})",
                self.scratch_dir.display(),
                self.database_path.display()
            )));
        }
        if self.tls_cert_file.is_some() != self.tls_key_file.is_some() {
            return Err(ConfigError::Invalid(
                "both tls_cert_file and tls_key_file must be set together".into(),
            ));
        }
        if self.is_production() && !self.tls_enabled() && !self.allow_insecure_http {
            return Err(ConfigError::Invalid(
                "TLS must be configured in production unless allow_insecure_http=true".into(),
            ));
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.env.eq_ignore_ascii_case("production")
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_file.is_some() && self.tls_key_file.is_some()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// True when `database` lives directly inside `scratch_dir`
fn scratch_holds_database(scratch_dir: &Path, database: &Path) -> bool {
    let db_dir = database
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    if let (Ok(a), Ok(b)) = (fs::canonicalize(scratch_dir), fs::canonicalize(db_dir)) {
        return a == b;
    }
    lexical(scratch_dir) == lexical(db_dir)
}

fn lexical(path: &Path) -> PathBuf {
    let normalized: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if normalized.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        normalized
    }
}

/// Load environment variables from the canonical environment file.
///
/// Checks `LAKE_AGENT_ENV_FILE` first, then [`ENV_FILE_PATHS`] in order.
/// Existing environment variables are never overridden.
///
/// Returns the path that was loaded, or None if no file was found.
pub fn load_environment() -> Option<String> {
    if let Ok(custom_path) = std::env::var("LAKE_AGENT_ENV_FILE") {
        if let Some(path) = try_load_env_file(&custom_path) {
            return Some(path);
        }
    }

    for path in ENV_FILE_PATHS {
        if let Some(loaded_path) = try_load_env_file(path) {
            return Some(loaded_path);
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

fn try_load_env_file(path: &str) -> Option<String> {
    let path_obj = Path::new(path);
    if !path_obj.exists() {
        return None;
    }

    match fs::read_to_string(path_obj) {
        Ok(content) => {
            let mut loaded_count = 0;
            let mut skipped_count = 0;

            for (key, value) in content.lines().filter_map(parse_env_line) {
                if std::env::var(&key).is_err() {
                    std::env::set_var(&key, &value);
                    loaded_count += 1;
                } else {
                    skipped_count += 1;
                }
            }

            info!(
                path = %path,
                loaded = loaded_count,
                skipped = skipped_count,
                "Loaded environment file"
            );
            Some(path.to_string())
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to read environment file");
            None
        }
    }
}

/// Parse a single `KEY=VALUE` line; comments and blanks yield None.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_with_token() {
        let config = AgentConfig::from_sources(None, env(&[("AGENT_TOKEN", "secret")])).unwrap();
        assert_eq!(config.token, "secret");
        assert_eq!(config.listen_addr, "0.0.0.0:9443");
        assert_eq!(config.max_concurrent_queries, 8);
        assert_eq!(config.max_result_rows, 10_000);
        assert_eq!(config.default_page_size, 1000);
        assert_eq!(config.max_page_size, 5000);
        assert_eq!(config.query_timeout(), Duration::from_secs(120));
        assert_eq!(config.scratch_dir, PathBuf::from("lake-agent-scratch"));
        assert!(config.query_lifecycle_enabled);
        assert_eq!(config.log_format, LogFormat::Compact);
        assert!(!config.tls_enabled());
    }

    #[test]
    fn test_environment_overrides() {
        let config = AgentConfig::from_sources(
            None,
            env(&[
                ("AGENT_TOKEN", "secret"),
                ("AGENT_MAX_CONCURRENT_QUERIES", "2"),
                ("AGENT_RESULT_TTL_SECS", "30"),
                ("AGENT_QUERY_LIFECYCLE_ENABLED", "false"),
                ("AGENT_LOG_FORMAT", "json"),
            ]),
        )
        .unwrap();
        assert_eq!(config.max_concurrent_queries, 2);
        assert_eq!(config.result_ttl(), Duration::from_secs(30));
        assert!(!config.query_lifecycle_enabled);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_token_required() {
        let err = AgentConfig::from_sources(None, env(&[])).unwrap_err();
        assert!(err.to_string().contains("AGENT_TOKEN") || matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_tls_files_must_pair() {
        let err = AgentConfig::from_sources(
            None,
            env(&[("AGENT_TOKEN", "secret"), ("AGENT_TLS_CERT_FILE", "/tmp/cert.pem")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("tls_key_file"));
    }

    #[test]
    fn test_production_requires_tls() {
        let err = AgentConfig::from_sources(
            None,
            env(&[("AGENT_TOKEN", "secret"), ("AGENT_ENV", "production")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("production"));

        let config = AgentConfig::from_sources(
            None,
            env(&[
                ("AGENT_TOKEN", "secret"),
                ("AGENT_ENV", "Production"),
                ("AGENT_ALLOW_INSECURE_HTTP", "true"),
            ]),
        )
        .unwrap();
        assert!(config.is_production());
    }

    #[test]
    fn test_page_sizes_ordered() {
        let err = AgentConfig::from_sources(
            None,
            env(&[("AGENT_TOKEN", "secret"), ("AGENT_DEFAULT_PAGE_SIZE", "9000")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("default_page_size"));
    }

    #[test]
    fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(&path, "token = \"from-file\"\nmax_page_size = 100\ndefault_page_size = 50\n").unwrap();

        let config = AgentConfig::from_sources(path.to_str(), env(&[])).unwrap();
        assert_eq!(config.token, "from-file");
        assert_eq!(config.max_page_size, 100);
        assert_eq!(config.default_page_size, 50);
    }

    #[test]
    fn test_scratch_dir_must_not_hold_database() {
        let err = AgentConfig::from_sources(
            None,
            env(&[
                ("AGENT_TOKEN", "secret"),
                ("AGENT_DATABASE_PATH", "/var/lib/lake/lake.db"),
                ("AGENT_SCRATCH_DIR", "/var/lib/lake/"),
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("scratch_dir"));

        let err = AgentConfig::from_sources(
            None,
            env(&[
                ("AGENT_TOKEN", "secret"),
                ("AGENT_DATABASE_PATH", "lake.db"),
                ("AGENT_SCRATCH_DIR", "."),
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("scratch_dir"));

        let config = AgentConfig::from_sources(
            None,
            env(&[
                ("AGENT_TOKEN", "secret"),
                ("AGENT_DATABASE_PATH", "/var/lib/lake/lake.db"),
                ("AGENT_SCRATCH_DIR", "/var/lib/lake/scratch"),
            ]),
        )
        .unwrap();
        assert_eq!(config.scratch_dir, PathBuf::from("/var/lib/lake/scratch"));
    }

    #[test]
    fn test_parse_env_line_simple() {
        let (k, v) = parse_env_line("FOO=bar").unwrap();
        assert_eq!(k, "FOO");
        assert_eq!(v, "bar");
    }

    #[test]
    fn test_parse_env_line_quoted_and_exported() {
        let (k, v) = parse_env_line("export AGENT_TOKEN=\"a b\"").unwrap();
        assert_eq!(k, "AGENT_TOKEN");
        assert_eq!(v, "a b");

        let (_, v) = parse_env_line("FOO='bar'").unwrap();
        assert_eq!(v, "bar");
    }

    #[test]
    fn test_parse_env_line_skips_noise() {
        assert!(parse_env_line("").is_none());
        assert!(parse_env_line("# comment").is_none());
        assert!(parse_env_line("=value").is_none());
        assert!(parse_env_line("NOEQUALS").is_none());
    }
}
