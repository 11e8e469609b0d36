//! Per-scope unit watchers: bus signal stream, or filesystem fallback for
//! hosts without reliable user-session buses.

use std::path::PathBuf;
use std::sync::Arc;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::bus::UnitSignal;
use super::{UnitScope, UnitsBackend};

/// Marker prefix of per-unit invocation files in the runtime directory.
const INVOCATION_PREFIX: &str = "invocation:";

/// Spawns the watcher consuming init-system bus signals for one scope.
pub(crate) fn spawn_bus_watcher(
    backend: Arc<UnitsBackend>,
    scope: UnitScope,
    mut signals: mpsc::Receiver<UnitSignal>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = backend.cancel.cancelled() => break,
                signal = signals.recv() => {
                    match signal {
                        Some(signal) => {
                            backend
                                .apply_unit_change(scope, &signal.unit, signal.sub_state)
                                .await;
                        }
                        None => break,
                    }
                }
            }
        }
        log::debug!("[Units] {scope} watcher stopped");
    });
}

/// Spawns the filesystem fallback watcher for user units.
///
/// Appearance and removal of `invocation:<unit>` files in the user runtime
/// directory mark unit start and stop; the whitelist filter and dedup live
/// in the shared change-application path.
pub(crate) fn spawn_headless_watcher(
    backend: Arc<UnitsBackend>,
    dir: PathBuf,
) -> notify::Result<()> {
    let (tx, mut rx) = mpsc::channel::<notify::Event>(16);
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(e) => log::warn!("[Units] filesystem watcher error: {e}"),
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    log::info!("[Units] watching {} for user unit transitions", dir.display());

    tokio::spawn(async move {
        // Keep the watcher alive with the task; dropping it stops events.
        let _watcher = watcher;
        loop {
            tokio::select! {
                _ = backend.cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let sub_state = match event.kind {
                        EventKind::Create(_) => "running",
                        EventKind::Remove(_) => "dead",
                        _ => continue,
                    };
                    for path in &event.paths {
                        let Some(file_name) = path.file_name().and_then(|name| name.to_str())
                        else {
                            continue;
                        };
                        let Some(unit) = file_name.strip_prefix(INVOCATION_PREFIX) else {
                            continue;
                        };
                        backend
                            .apply_unit_change(
                                UnitScope::User,
                                unit,
                                Some(sub_state.to_string()),
                            )
                            .await;
                    }
                }
            }
        }
        log::debug!("[Units] headless watcher stopped");
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemdConfig;
    use crate::events::EventType;
    use crate::units::SERVICES_KEY;
    use std::path::Path;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn filesystem_transitions_emit_service_updated() {
        let dir = tempfile::tempdir().unwrap();
        let config = SystemdConfig {
            enabled: true,
            system: vec![],
            user: vec!["allowed.service".to_string()],
            headless: true,
        };
        let backend = UnitsBackend::new(&config, None, None, CancellationToken::new()).unwrap();

        // Seed the cache the way start() would: no user bus available, so
        // the whitelist becomes placeholder entries.
        let services = backend.enumerate().await.unwrap();
        backend.cache.set(SERVICES_KEY, services);
        spawn_headless_watcher(Arc::clone(&backend), dir.path().to_path_buf()).unwrap();
        let mut events = backend.events().unwrap();

        // Give the watcher a moment to arm before touching the directory.
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("invocation:allowed.service"), b"").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("transition should surface within 5s")
            .unwrap();
        assert_eq!(event.event_type, EventType::ServiceUpdated);
        assert_eq!(event.data["name"], "allowed.service");
        assert_eq!(event.data["running"], true);

        // Files outside the invocation namespace are ignored.
        std::fs::write(dir.path().join("unrelated"), b"").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn invocation_files_name_the_unit() {
        let path = Path::new("/run/user/1000/systemd/units/invocation:spotifyd.service");
        let unit = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(INVOCATION_PREFIX));
        assert_eq!(unit, Some("spotifyd.service"));

        let other = Path::new("/run/user/1000/systemd/units/spotifyd.service");
        assert!(other
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(INVOCATION_PREFIX))
            .is_none());
    }
}
