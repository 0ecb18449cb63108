use std::collections::BTreeMap;

use serde::Deserialize;
use walcast_core::BufferOverflow;

use crate::error::{ConfigError, ConfigResult};

/// Listener configuration as parsed from `walcast.toml`.
#[derive(Debug, Deserialize)]
pub struct ListenerFile {
    /// Replication slot name.
    pub slot: String,
    /// Postgres connection string. May reference `${VAR}` environment variables.
    pub connection_string: String,
    /// Maximum seconds between standby status updates.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default)]
    pub flow: FlowSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    /// Run-time parameters set on every connection.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub tables: Vec<TableSection>,
}

impl ListenerFile {
    /// Parse a listener config from a TOML string.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let config: ListenerFile = toml::from_str(toml_str)?;
        Ok(config)
    }
}

/// Event buffer settings.
#[derive(Debug, Deserialize)]
pub struct FlowSection {
    #[serde(default)]
    pub replay: usize,
    #[serde(default = "default_extra_buffer_capacity")]
    pub extra_buffer_capacity: usize,
    #[serde(default)]
    pub overflow: BufferOverflow,
}

impl Default for FlowSection {
    fn default() -> Self {
        Self {
            replay: 0,
            extra_buffer_capacity: default_extra_buffer_capacity(),
            overflow: BufferOverflow::default(),
        }
    }
}

/// Reconnect delay bounds in milliseconds.
#[derive(Debug, Deserialize)]
pub struct BackoffSection {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// A captured table.
#[derive(Debug, Deserialize)]
pub struct TableSection {
    /// Schema-qualified name, e.g. `public.orders`.
    pub name: String,
    /// `default`, `full`, `nothing` or `using index <name>`.
    #[serde(default = "default_replica_identity")]
    pub replica_identity: String,
}

fn default_status_interval_secs() -> u64 {
    10
}

fn default_extra_buffer_capacity() -> usize {
    32
}

fn default_min_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_replica_identity() -> String {
    "default".to_string()
}

/// Resolve `${VAR_NAME}` references from the process environment.
pub fn resolve_env(s: &str) -> ConfigResult<String> {
    resolve_env_with(s, |name| std::env::var(name).ok())
}

/// Resolve `${VAR_NAME}` references with a custom lookup. Unset variables are an error.
pub fn resolve_env_with(s: &str, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<String> {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            return Err(ConfigError::UnterminatedVariable {
                value: s.to_string(),
            });
        };
        let name = &rest[start + 2..start + end];
        let value = lookup(name).ok_or_else(|| ConfigError::UnresolvedVariable {
            name: name.to_string(),
        })?;

        result.push_str(&rest[..start]);
        result.push_str(&value);
        rest = &rest[start + end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "DATABASE_URL" => Some("postgres://localhost/app".to_string()),
            "USER" => Some("walcast".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
slot = "walcast"
connection_string = "${DATABASE_URL}"
"#;

        let config = ListenerFile::parse(toml).unwrap();
        assert_eq!(config.slot, "walcast");
        assert_eq!(config.connection_string, "${DATABASE_URL}");
        assert_eq!(config.status_interval_secs, 10);
        assert_eq!(config.flow.replay, 0);
        assert_eq!(config.flow.extra_buffer_capacity, 32);
        assert_eq!(config.flow.overflow, BufferOverflow::Suspend);
        assert_eq!(config.backoff.min_delay_ms, 500);
        assert_eq!(config.backoff.max_delay_ms, 8000);
        assert!(config.properties.is_empty());
        assert!(config.tables.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
slot = "orders_cdc"
connection_string = "postgres://user@db/shop"
status_interval_secs = 5

[flow]
replay = 1
extra_buffer_capacity = 8
overflow = "drop_oldest"

[backoff]
min_delay_ms = 100
max_delay_ms = 2000

[properties]
application_name = "walcast"

[[tables]]
name = "public.orders"
replica_identity = "full"

[[tables]]
name = "public.customers"
"#;

        let config = ListenerFile::parse(toml).unwrap();
        assert_eq!(config.slot, "orders_cdc");
        assert_eq!(config.status_interval_secs, 5);
        assert_eq!(config.flow.replay, 1);
        assert_eq!(config.flow.extra_buffer_capacity, 8);
        assert_eq!(config.flow.overflow, BufferOverflow::DropOldest);
        assert_eq!(config.backoff.min_delay_ms, 100);
        assert_eq!(config.properties["application_name"], "walcast");
        assert_eq!(config.tables.len(), 2);
        assert_eq!(config.tables[0].replica_identity, "full");
        assert_eq!(config.tables[1].replica_identity, "default");
    }

    #[test]
    fn test_parse_rejects_unknown_overflow() {
        let toml = r#"
slot = "walcast"
connection_string = "postgres://localhost/app"

[flow]
overflow = "drop_everything"
"#;

        assert!(matches!(
            ListenerFile::parse(toml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_requires_slot() {
        let toml = r#"connection_string = "postgres://localhost/app""#;
        assert!(ListenerFile::parse(toml).is_err());
    }

    #[test]
    fn test_resolve_env() {
        assert_eq!(
            resolve_env_with("${DATABASE_URL}", lookup).unwrap(),
            "postgres://localhost/app"
        );
        assert_eq!(
            resolve_env_with("prefix_${USER}_suffix", lookup).unwrap(),
            "prefix_walcast_suffix"
        );
        assert_eq!(
            resolve_env_with("${USER}:${USER}", lookup).unwrap(),
            "walcast:walcast"
        );
        assert_eq!(resolve_env_with("no_vars", lookup).unwrap(), "no_vars");
    }

    #[test]
    fn test_resolve_env_missing_variable() {
        let result = resolve_env_with("postgres://${PGHOST}/app", lookup);
        assert!(matches!(
            result,
            Err(ConfigError::UnresolvedVariable { ref name }) if name == "PGHOST"
        ));
    }

    #[test]
    fn test_resolve_env_unterminated() {
        let result = resolve_env_with("postgres://${PGHOST/app", lookup);
        assert!(matches!(result, Err(ConfigError::UnterminatedVariable { .. })));
    }
}
