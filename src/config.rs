//! Configuration surface consumed by the coordinator.
//!
//! The engine does not own environment resolution or CLI parsing; callers
//! may build [`MigrationConfig`] directly, or use [`MigrationConfig::load`]
//! to read `config/config.toml` with environment-variable fallback.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Which handler processes each pending migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    #[default]
    Apply,
    MarkComplete,
    ExecuteExternally,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Allow re-applying a migration whose content drifted since it was
    /// recorded. Off by default; drift is a fatal conflict.
    #[serde(default)]
    pub override_allowed: bool,
    /// Lease TTL. A holder that stops renewing loses the lock after this.
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: u32,
    /// Pause between acquisition attempts while the lock is contested.
    #[serde(default = "default_acquire_retry_ms")]
    pub acquire_retry_ms: u64,
    /// Ceiling on total acquisition waiting; exceeding it is fatal.
    #[serde(default = "default_acquire_timeout_seconds")]
    pub acquire_timeout_seconds: u64,
    #[serde(default)]
    pub handler: HandlerKind,
    /// External tool invoked per migration when `handler` is
    /// `execute_externally`; the content is appended as the last argument.
    #[serde(default)]
    pub external_command: Option<String>,
}

fn default_lock_ttl_seconds() -> u32 {
    60
}

fn default_acquire_retry_ms() -> u64 {
    500
}

fn default_acquire_timeout_seconds() -> u64 {
    300
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            override_allowed: false,
            lock_ttl_seconds: default_lock_ttl_seconds(),
            acquire_retry_ms: default_acquire_retry_ms(),
            acquire_timeout_seconds: default_acquire_timeout_seconds(),
            handler: HandlerKind::default(),
            external_command: None,
        }
    }
}

impl MigrationConfig {
    /// Load the migration configuration from `config/config.toml`, falling
    /// back to `CASSANDRA_MIGRATE__`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when neither source yields a valid `migration`
    /// section.
    pub fn load() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("config/config.toml").required(false))
            .add_source(Environment::with_prefix("CASSANDRA_MIGRATE").separator("__"));

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                // The file existed but was unreadable; retry with env only.
                if std::path::Path::new("config/config.toml").exists() {
                    log::warn!("failed to load config file, falling back to env: {err}");
                }
                Config::builder()
                    .add_source(Environment::with_prefix("CASSANDRA_MIGRATE").separator("__"))
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "failed to load configuration from file ({err}) and env ({env_err})"
                        ))
                    })?
            }
        };

        settings.get::<MigrationConfig>("migration").map_err(|e| {
            ConfigError::Message(format!(
                "migration configuration could not be loaded from file or environment: {e}"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn parse(toml: &str) -> MigrationConfig {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .get::<MigrationConfig>("migration")
            .unwrap()
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = MigrationConfig::default();
        assert!(!config.override_allowed);
        assert_eq!(config.lock_ttl_seconds, 60);
        assert_eq!(config.acquire_retry_ms, 500);
        assert_eq!(config.acquire_timeout_seconds, 300);
        assert_eq!(config.handler, HandlerKind::Apply);
        assert!(config.external_command.is_none());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = parse("[migration]\nlock_ttl_seconds = 5\n");
        assert_eq!(config.lock_ttl_seconds, 5);
        assert_eq!(config.acquire_retry_ms, 500);
        assert_eq!(config.handler, HandlerKind::Apply);
    }

    #[test]
    fn handler_kind_deserializes_snake_case() {
        let config = parse(
            "[migration]\nhandler = \"execute_externally\"\nexternal_command = \"cqlsh-apply\"\n",
        );
        assert_eq!(config.handler, HandlerKind::ExecuteExternally);
        assert_eq!(config.external_command.as_deref(), Some("cqlsh-apply"));
    }
}
