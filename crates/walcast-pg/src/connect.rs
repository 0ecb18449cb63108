//! Shared Postgres connection utilities with TLS support.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres::config::SslMode as PgSslMode;
use tokio_postgres::Client;
use tokio_postgres_rustls_improved::MakeRustlsConnect;

use crate::error::{PgError, PgResult};
use crate::replication::params::{ConnectionParams, SslMode};

/// Connect the control plane with TLS settings taken from the connection string's sslmode.
/// `properties` are applied as run-time parameters (`-c key=value`).
/// Spawns the connection task and returns only the client.
pub async fn connect_postgres(
    connection_string: &str,
    properties: &BTreeMap<String, String>,
) -> PgResult<Client> {
    let params = ConnectionParams::parse(connection_string)?;
    let config = client_config(&params, properties);

    if params.sslmode.requires_tls() {
        let (client, connection) = config
            .connect(tls_connector()?)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Postgres connection error");
            }
        });

        Ok(client)
    } else {
        let (client, connection) = config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Postgres connection error");
            }
        });

        Ok(client)
    }
}

fn client_config(
    params: &ConnectionParams,
    properties: &BTreeMap<String, String>,
) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&params.host)
        .port(params.port)
        .user(&params.user)
        .dbname(&params.database)
        .ssl_mode(match params.sslmode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Prefer => PgSslMode::Prefer,
            _ => PgSslMode::Require,
        });
    if !params.password.is_empty() {
        config.password(&params.password);
    }
    if !properties.is_empty() {
        config.options(&runtime_options(properties));
    }
    config
}

/// Render properties as a startup `options` value: `-c key=value` per entry.
pub(crate) fn runtime_options(properties: &BTreeMap<String, String>) -> String {
    properties
        .iter()
        .map(|(key, value)| format!("-c {}={}", escape_option(key), escape_option(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape_option(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c.is_whitespace() {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Rustls connector trusting the webpki roots.
pub(crate) fn tls_connector() -> PgResult<MakeRustlsConnect> {
    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| PgError::Tls(format!("TLS config error: {}", e)))?
            .with_root_certificates(root_certs())
            .with_no_client_auth();

    Ok(MakeRustlsConnect::new(config))
}

/// Get root certificates from webpki-roots.
fn root_certs() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_options() {
        let properties = BTreeMap::from([
            ("statement_timeout".to_string(), "0".to_string()),
            ("application_name".to_string(), "walcast worker".to_string()),
        ]);

        assert_eq!(
            runtime_options(&properties),
            r"-c application_name=walcast\ worker -c statement_timeout=0"
        );
    }

    #[test]
    fn test_client_config_maps_sslmode() {
        let params = ConnectionParams::parse("postgres://u:p@db:5433/app?sslmode=verify-full").unwrap();
        let config = client_config(&params, &BTreeMap::new());

        assert_eq!(config.get_ssl_mode(), PgSslMode::Require);
        assert_eq!(config.get_user(), Some("u"));
        assert_eq!(config.get_dbname(), Some("app"));
        assert_eq!(config.get_ports(), &[5433]);
        assert_eq!(config.get_options(), None);
    }
}
