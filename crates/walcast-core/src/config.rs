//! Listener settings.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::error::{Error, Result};
use crate::flow::FlowConfig;
use crate::ident::SlotName;
use crate::registry::TableRegistry;

pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Everything a listener needs to connect, stream and publish.
pub struct ListenerConfig<R> {
    pub slot_name: SlotName,
    /// Postgres URL or key/value connection string.
    pub connection_string: String,
    /// Maximum time between standby status updates.
    pub status_interval: Duration,
    pub flow: FlowConfig,
    pub backoff: BackoffConfig,
    /// Run-time parameters set on every connection.
    pub properties: BTreeMap<String, String>,
    pub tables: TableRegistry<R>,
}

impl<R> ListenerConfig<R> {
    /// Config with default timings and buffer sizes.
    pub fn new(
        slot_name: SlotName,
        connection_string: impl Into<String>,
        tables: TableRegistry<R>,
    ) -> Self {
        Self {
            slot_name,
            connection_string: connection_string.into(),
            status_interval: DEFAULT_STATUS_INTERVAL,
            flow: FlowConfig::default(),
            backoff: BackoffConfig::default(),
            properties: BTreeMap::new(),
            tables,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Reject settings that would make the stream or the reconnect loop spin.
    pub fn validate(&self) -> Result<()> {
        if self.status_interval.is_zero() {
            return Err(Error::InvalidListenerConfig(
                "status interval must be positive".into(),
            ));
        }
        if self.backoff.min_delay.is_zero() || self.backoff.min_delay > self.backoff.max_delay {
            return Err(Error::InvalidListenerConfig(format!(
                "backoff min delay ({:?}) must be positive and not exceed max delay ({:?})",
                self.backoff.min_delay, self.backoff.max_delay
            )));
        }
        self.flow.validate()
    }
}

impl<R> Clone for ListenerConfig<R> {
    fn clone(&self) -> Self {
        Self {
            slot_name: self.slot_name.clone(),
            connection_string: self.connection_string.clone(),
            status_interval: self.status_interval,
            flow: self.flow,
            backoff: self.backoff,
            properties: self.properties.clone(),
            tables: self.tables.clone(),
        }
    }
}

impl<R> fmt::Debug for ListenerConfig<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The connection string may carry a password.
        f.debug_struct("ListenerConfig")
            .field("slot_name", &self.slot_name)
            .field("status_interval", &self.status_interval)
            .field("flow", &self.flow)
            .field("backoff", &self.backoff)
            .field("properties", &self.properties)
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}
