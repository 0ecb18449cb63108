use std::io::{self, Write};

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info;
use walcast_core::{FieldMap, ListenerConfig, WalEvent};
use walcast_pg::{ListenerState, WalListener};

fn render_event(event: &WalEvent<FieldMap>, pretty: bool) -> serde_json::Result<String> {
    if pretty {
        serde_json::to_string_pretty(event)
    } else {
        serde_json::to_string(event)
    }
}

/// Stream events as JSON lines until Ctrl-C or the listener stops on its own.
pub async fn cmd_listen(
    config: ListenerConfig<FieldMap>,
    recreate_slot: bool,
    pretty: bool,
) -> Result<()> {
    if config.tables.is_empty() {
        anyhow::bail!("No tables configured. Add a [[tables]] entry to walcast.toml.");
    }

    let slot = config.slot_name.clone();
    let listener = WalListener::new(config)?;
    let mut events = listener.subscribe();

    listener
        .start(recreate_slot)
        .await
        .with_context(|| format!("Failed to start listener on slot '{}'", slot))?;
    eprintln!(
        "{}",
        format!("Listening on slot '{}'. Press Ctrl-C to stop.", slot).green()
    );

    let mut state = listener.watch_state();
    let mut stdout = io::stdout().lock();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, stopping");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() == ListenerState::Idle {
                    eprintln!("{}", "Listener stopped.".yellow());
                    break;
                }
            }
            event = events.recv() => {
                let line = render_event(&event, pretty)?;
                writeln!(stdout, "{}", line)?;
                stdout.flush()?;
            }
        }
    }

    drop(events);
    listener.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use walcast_core::{decode_event, ReplicaIdentity, TableRegistration, TableRegistry};

    #[test]
    fn test_render_event() {
        let tables = TableRegistry::new([TableRegistration::raw(
            "public.orders".parse().unwrap(),
            ReplicaIdentity::Full,
        )])
        .unwrap();
        let raw = br#"{"action":"D","timestamp":"2024-01-15 10:30:00+00","schema":"public","table":"orders","identity":[{"name":"id","value":7}]}"#;
        let event = tables.map_event(decode_event(raw).unwrap()).unwrap();

        let line = render_event(&event, false).unwrap();
        assert!(!line.contains('\n'));

        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["type"], "change");
        assert_eq!(json["table"], "public.orders");
        assert_eq!(json["payload"]["kind"], "delete");
        assert_eq!(json["payload"]["old"]["id"], 7);

        assert!(render_event(&event, true).unwrap().contains('\n'));
    }
}
