use std::time::Duration;

use walcast_core::{
    BackoffConfig, FieldMap, FlowConfig, ListenerConfig, ReplicaIdentity, SlotName, TableName,
    TableRegistration, TableRegistry,
};

use crate::error::{ConfigError, ConfigResult};
use crate::listener::{resolve_env_with, ListenerFile, TableSection};

/// Validate a listener configuration without resolving environment variables.
pub fn validate_listener(config: &ListenerFile) -> ConfigResult<()> {
    SlotName::parse(&config.slot)?;
    validate_status_interval(config)?;
    validate_backoff(config)?;
    flow_config(config).validate()?;
    for table in &config.tables {
        parse_table(table)?;
    }
    Ok(())
}

fn validate_status_interval(config: &ListenerFile) -> ConfigResult<()> {
    if config.status_interval_secs == 0 {
        return Err(ConfigError::InvalidStatusInterval);
    }
    Ok(())
}

fn validate_backoff(config: &ListenerFile) -> ConfigResult<()> {
    let backoff = &config.backoff;
    if backoff.min_delay_ms == 0 || backoff.min_delay_ms > backoff.max_delay_ms {
        return Err(ConfigError::InvalidBackoff {
            min: backoff.min_delay_ms,
            max: backoff.max_delay_ms,
        });
    }
    Ok(())
}

fn flow_config(config: &ListenerFile) -> FlowConfig {
    FlowConfig {
        replay: config.flow.replay,
        extra_buffer_capacity: config.flow.extra_buffer_capacity,
        overflow: config.flow.overflow,
    }
}

fn parse_table(table: &TableSection) -> ConfigResult<(TableName, ReplicaIdentity)> {
    let invalid = |e: walcast_core::Error| ConfigError::InvalidTable {
        name: table.name.clone(),
        message: e.to_string(),
    };
    let name = table.name.parse::<TableName>().map_err(invalid)?;
    let identity = table
        .replica_identity
        .parse::<ReplicaIdentity>()
        .map_err(invalid)?;
    Ok((name, identity))
}

/// Registry of the configured tables with identity mappers.
pub fn table_registry(config: &ListenerFile) -> ConfigResult<TableRegistry<FieldMap>> {
    let registrations = config
        .tables
        .iter()
        .map(|table| {
            let (name, identity) = parse_table(table)?;
            Ok(TableRegistration::raw(name, identity))
        })
        .collect::<ConfigResult<Vec<_>>>()?;
    Ok(TableRegistry::new(registrations)?)
}

/// Convert a listener file into a [`ListenerConfig`] publishing raw row images,
/// resolving `${VAR}` references from the process environment.
pub fn to_listener_config(config: &ListenerFile) -> ConfigResult<ListenerConfig<FieldMap>> {
    to_listener_config_with(config, |name| std::env::var(name).ok())
}

/// Like [`to_listener_config`] with a custom variable lookup.
pub fn to_listener_config_with(
    config: &ListenerFile,
    lookup: impl Fn(&str) -> Option<String>,
) -> ConfigResult<ListenerConfig<FieldMap>> {
    validate_listener(config)?;

    let slot = SlotName::parse(&config.slot)?;
    let connection_string = resolve_env_with(&config.connection_string, &lookup)?;
    if connection_string.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: "connection_string".into(),
        });
    }

    let tables = table_registry(config)?;

    let mut listener = ListenerConfig::new(slot, connection_string, tables);
    listener.status_interval = Duration::from_secs(config.status_interval_secs);
    listener.flow = flow_config(config);
    listener.backoff = BackoffConfig {
        min_delay: Duration::from_millis(config.backoff.min_delay_ms),
        max_delay: Duration::from_millis(config.backoff.max_delay_ms),
    };
    for (key, value) in &config.properties {
        listener
            .properties
            .insert(key.clone(), resolve_env_with(value, &lookup)?);
    }

    listener.validate()?;
    Ok(listener)
}
