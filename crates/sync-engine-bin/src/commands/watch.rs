//! Watch command.

use sync_config_and_utils::{Config, Paths};
use sync_engine::{Snapshot, SubscriptionEvent, SyncEngine, WatchOptions};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Subscribe to `resource` and print snapshots until Ctrl-C.
pub async fn watch(
    config: &Config,
    paths: &Paths,
    resource: &str,
    seed: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let seed = match seed {
        Some(raw) => Some(Snapshot::from_value(serde_json::from_str(raw)?)?),
        None => None,
    };

    let engine = SyncEngine::from_config(config, paths)?;
    let handle = engine.watch(resource, seed, WatchOptions::default().notify_on_change())?;
    let mut snapshots = handle.snapshots();
    let mut events = handle.events();

    print_snapshot(resource, &handle.snapshot())?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print_snapshot(resource, &snapshot)?;
            }
            event = events.recv() => match event {
                Ok(SubscriptionEvent::StateChanged { from, to }) => {
                    eprintln!("[{resource}] {from} -> {to}");
                }
                Ok(SubscriptionEvent::Changed { kind, record_id }) => {
                    eprintln!("[{resource}] {kind} {record_id}");
                }
                Ok(SubscriptionEvent::Refreshed { records }) => {
                    eprintln!("[{resource}] refreshed ({records} records)");
                }
                Ok(SubscriptionEvent::Error(err)) => {
                    eprintln!("[{resource}] error: {err}");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Dropped subscription events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn print_snapshot(resource: &str, snapshot: &Snapshot) -> Result<(), serde_json::Error> {
    println!(
        "{}",
        serde_json::to_string(&serde_json::json!({
            "resource": resource,
            "records": snapshot.to_value(),
        }))?
    );
    Ok(())
}
