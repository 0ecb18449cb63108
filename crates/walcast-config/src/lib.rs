mod error;
mod listener;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use listener::{
    resolve_env, resolve_env_with, BackoffSection, FlowSection, ListenerFile, TableSection,
};
pub use validation::{
    table_registry, to_listener_config, to_listener_config_with, validate_listener,
};
