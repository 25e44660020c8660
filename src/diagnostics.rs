//! Text panel over the pipeline's published diagnostics.

use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;

use crate::protocol::DiagnosticsSnapshot;

/// Formats one snapshot as the panel's display lines.
pub fn panel_lines(snapshot: &DiagnosticsSnapshot) -> Vec<String> {
    let storage = match snapshot.store_bytes {
        Some(bytes) => format!("Storage: {bytes} bytes"),
        None => "Storage: unavailable".to_string(),
    };
    let backoff = if snapshot.active_backoffs.is_empty() {
        "None".to_string()
    } else {
        snapshot
            .active_backoffs
            .iter()
            .map(|report| format!("{}:{}s", report.handle, report.seconds_remaining))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let paused = if snapshot.global_pause_seconds_remaining > 0 {
        format!("{}s", snapshot.global_pause_seconds_remaining)
    } else {
        "No".to_string()
    };

    vec![
        storage,
        format!("Memory: {} entries", snapshot.cache_entries),
        format!("Queue: {}", snapshot.queue_depth),
        format!("Backoff: {backoff}"),
        format!("Paused: {paused}"),
        format!(
            "Lookups: {} sent, {} rate limited, {} failed, {} expired in queue",
            snapshot.lookups_dispatched,
            snapshot.lookups_rejected,
            snapshot.lookups_failed,
            snapshot.stale_evictions
        ),
    ]
}

/// Logs the latest snapshot every `poll_interval` whenever it changed.
/// Stops on shutdown or once the publishing pipeline is gone.
pub async fn run_panel(
    mut snapshots: watch::Receiver<DiagnosticsSnapshot>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut rendered = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {
                match snapshots.has_changed() {
                    Ok(true) => {
                        let snapshot = snapshots.borrow_and_update().clone();
                        for line in panel_lines(&snapshot) {
                            info!("[panel] {}", line);
                        }
                        rendered += 1;
                    }
                    Ok(false) => {}
                    Err(_) => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Diagnostics panel stopped after {} renders", rendered);
    rendered
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::watch;

    use super::{panel_lines, run_panel};
    use crate::protocol::{BackoffReport, DiagnosticsSnapshot};

    #[test]
    fn test_panel_lines_for_idle_pipeline() {
        let snapshot = DiagnosticsSnapshot {
            store_bytes: Some(512),
            ..DiagnosticsSnapshot::default()
        };

        let lines = panel_lines(&snapshot);
        assert_eq!(lines[0], "Storage: 512 bytes");
        assert_eq!(lines[1], "Memory: 0 entries");
        assert_eq!(lines[2], "Queue: 0");
        assert_eq!(lines[3], "Backoff: None");
        assert_eq!(lines[4], "Paused: No");
    }

    #[test]
    fn test_panel_lines_list_backoffs_and_pause() {
        let snapshot = DiagnosticsSnapshot {
            queue_depth: 3,
            cache_entries: 7,
            active_backoffs: vec![
                BackoffReport {
                    handle: "alice".to_string(),
                    seconds_remaining: 12,
                },
                BackoffReport {
                    handle: "bob".to_string(),
                    seconds_remaining: 3,
                },
            ],
            global_pause_seconds_remaining: 25,
            ..DiagnosticsSnapshot::default()
        };

        let lines = panel_lines(&snapshot);
        assert_eq!(lines[0], "Storage: unavailable");
        assert_eq!(lines[1], "Memory: 7 entries");
        assert_eq!(lines[2], "Queue: 3");
        assert_eq!(lines[3], "Backoff: alice:12s, bob:3s");
        assert_eq!(lines[4], "Paused: 25s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panel_renders_changes_until_shutdown() {
        let (snapshot_tx, snapshot_rx) = watch::channel(DiagnosticsSnapshot::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (rendered, _) = tokio::join!(
            run_panel(snapshot_rx, Duration::from_secs(1), shutdown_rx),
            async {
                snapshot_tx.send_replace(DiagnosticsSnapshot {
                    queue_depth: 1,
                    ..DiagnosticsSnapshot::default()
                });
                tokio::time::sleep(Duration::from_millis(2_500)).await;
                snapshot_tx.send_replace(DiagnosticsSnapshot {
                    queue_depth: 2,
                    ..DiagnosticsSnapshot::default()
                });
                tokio::time::sleep(Duration::from_secs(2)).await;
                let _ = shutdown_tx.send(true);
            }
        );

        assert_eq!(rendered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panel_stops_when_publisher_is_dropped() {
        let (snapshot_tx, snapshot_rx) = watch::channel(DiagnosticsSnapshot::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(snapshot_tx);

        let rendered = run_panel(snapshot_rx, Duration::from_millis(100), shutdown_rx).await;
        assert_eq!(rendered, 0);
    }
}
