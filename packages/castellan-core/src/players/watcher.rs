//! Signal watcher and position heartbeat for the players backend.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::types::{PlaybackStatus, PlayerProperty, PlayerSignal};
use super::PlayersBackend;

/// Sampling interval for playback positions.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Spawns the long-lived task consuming external bus signals.
///
/// Transient upstream errors are logged and skipped; the watcher only
/// terminates on cancellation or when the signal stream closes.
pub(crate) fn spawn_watcher(
    backend: Arc<PlayersBackend>,
    mut signals: mpsc::Receiver<PlayerSignal>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = backend.cancel.cancelled() => break,
                signal = signals.recv() => {
                    match signal {
                        Some(PlayerSignal::PropertiesChanged { sender, properties }) => {
                            handle_properties_changed(&backend, &sender, properties).await;
                        }
                        Some(PlayerSignal::NameOwnerChanged { name, old_owner, new_owner }) => {
                            backend.handle_owner_changed(name, old_owner, new_owner).await;
                        }
                        None => break,
                    }
                }
            }
        }
        log::debug!("[Players] watcher stopped");
    });
}

/// Applies a typed properties-changed payload.
///
/// The sender is a transient unique id; unknown senders are ignored rather
/// than fetched, because a player we never enumerated is not ours to track.
async fn handle_properties_changed(
    backend: &Arc<PlayersBackend>,
    sender: &str,
    properties: Vec<PlayerProperty>,
) {
    let Some(bus_name) = backend.resolve_owner(sender) else {
        log::debug!("[Players] ignoring signal from unknown sender {sender}");
        return;
    };

    let update = backend.apply_properties(&bus_name, properties);
    if update.started_playing {
        ensure_heartbeat(backend);
    }
    if update.changed {
        backend.emit_player_updated(&bus_name).await;
    }
}

/// Starts the position heartbeat if it is not already running.
///
/// Concurrent calls collapse to one task via compare-exchange. The task
/// samples `Position` for every playing player through the same update path
/// the watcher uses, and exits on its own once no cached player is playing;
/// the watcher restarts it on the next transition into `Playing`.
pub(crate) fn ensure_heartbeat(backend: &Arc<PlayersBackend>) {
    if backend
        .heartbeat_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    let backend = Arc::clone(backend);
    tokio::spawn(async move {
        log::debug!("[Players] heartbeat started");
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = backend.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let playing: Vec<String> = backend
                        .list()
                        .into_iter()
                        .filter(|p| p.playback_status == PlaybackStatus::Playing)
                        .map(|p| p.bus_name)
                        .collect();
                    if playing.is_empty() {
                        break;
                    }
                    for bus_name in playing {
                        match backend.bus.position(&bus_name).await {
                            Ok(position) => {
                                let update = backend.apply_properties(
                                    &bus_name,
                                    vec![PlayerProperty::Position(position)],
                                );
                                if update.changed {
                                    backend.emit_player_updated(&bus_name).await;
                                }
                            }
                            Err(e) => {
                                log::debug!("[Players] position read failed for {bus_name}: {e}");
                            }
                        }
                    }
                }
            }
        }
        backend.heartbeat_running.store(false, Ordering::SeqCst);
        log::debug!("[Players] heartbeat stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MprisConfig;
    use crate::error::CastellanResult;
    use crate::players::types::{LoopStatus, Player, TransportCommand};
    use crate::players::PlayerBus;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NullBus;

    #[async_trait]
    impl PlayerBus for NullBus {
        async fn list_player_names(&self) -> CastellanResult<Vec<String>> {
            Ok(vec![])
        }
        async fn name_owner(&self, _bus_name: &str) -> CastellanResult<String> {
            Ok(String::new())
        }
        async fn load_player(&self, _bus_name: &str) -> CastellanResult<Player> {
            Ok(Player::default())
        }
        async fn position(&self, _bus_name: &str) -> CastellanResult<i64> {
            Ok(0)
        }
        async fn transport(
            &self,
            _bus_name: &str,
            _command: TransportCommand,
        ) -> CastellanResult<()> {
            Ok(())
        }
        async fn seek(&self, _bus_name: &str, _offset_us: i64) -> CastellanResult<()> {
            Ok(())
        }
        async fn set_position(
            &self,
            _bus_name: &str,
            _track_id: &str,
            _position_us: i64,
        ) -> CastellanResult<()> {
            Ok(())
        }
        async fn set_volume(&self, _bus_name: &str, _volume: f64) -> CastellanResult<()> {
            Ok(())
        }
        async fn set_loop_status(
            &self,
            _bus_name: &str,
            _status: LoopStatus,
        ) -> CastellanResult<()> {
            Ok(())
        }
        async fn set_shuffle(&self, _bus_name: &str, _shuffle: bool) -> CastellanResult<()> {
            Ok(())
        }
        async fn signals(&self) -> CastellanResult<mpsc::Receiver<PlayerSignal>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_exits_when_no_player_is_playing() {
        let backend = PlayersBackend::new(
            &MprisConfig::default(),
            Arc::new(NullBus),
            CancellationToken::new(),
        )
        .unwrap();

        ensure_heartbeat(&backend);
        // Restart while running is a no-op.
        ensure_heartbeat(&backend);

        // The first tick fires immediately, finds nothing playing, and the
        // task resets its running flag on exit.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_millis(10)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(!backend.heartbeat_running.load(Ordering::SeqCst));
    }
}
