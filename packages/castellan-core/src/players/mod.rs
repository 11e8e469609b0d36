//! Media players backend.
//!
//! Owns the session-bus connection seam, a cache of the current player
//! enumeration, and the watcher keeping that cache current. Every operation
//! validates the bus name first and consults the cached capability set
//! before issuing any outbound call.

mod bus;
pub mod mpris;
pub mod types;
mod watcher;

pub use bus::PlayerBus;
pub use mpris::MprisBus;
pub use types::{
    Capabilities, LoopStatus, PlaybackStatus, Player, PlayerProperty, PlayerSignal,
    TransportCommand, PLAYER_BUS_PREFIX,
};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::config::MprisConfig;
use crate::error::{CastellanError, CastellanResult};
use crate::events::{Event, EventType, BACKEND_CHANNEL_CAPACITY};

const PLAYERS_KEY: &str = "players";

/// Outcome of applying a batch of property updates to the cache.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct AppliedUpdate {
    /// At least one property actually changed.
    pub changed: bool,
    /// The player transitioned into `Playing`.
    pub started_playing: bool,
}

/// Backend for media player control and observation.
pub struct PlayersBackend {
    bus: Arc<dyn PlayerBus>,
    cache: TtlCache<&'static str, Vec<Player>>,
    /// Reverse index: transient unique connection id -> well-known name.
    owners: DashMap<String, String>,
    /// Last observed playback status per well-known name, for signal dedup.
    last_status: DashMap<String, PlaybackStatus>,
    events_tx: Mutex<Option<mpsc::Sender<Event>>>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    cancel: CancellationToken,
    heartbeat_running: AtomicBool,
}

impl PlayersBackend {
    /// Creates the backend, or `None` when disabled by configuration.
    pub fn new(
        config: &MprisConfig,
        bus: Arc<dyn PlayerBus>,
        cancel: CancellationToken,
    ) -> Option<Arc<Self>> {
        if !config.enabled {
            return None;
        }
        let (tx, rx) = mpsc::channel(BACKEND_CHANNEL_CAPACITY);
        Some(Arc::new(Self {
            bus,
            cache: TtlCache::new(Duration::ZERO),
            owners: DashMap::new(),
            last_status: DashMap::new(),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            cancel,
            heartbeat_running: AtomicBool::new(false),
        }))
    }

    /// Enumerates players, populates the cache, and starts the watcher.
    pub async fn start(self: &Arc<Self>) -> CastellanResult<()> {
        let names = self.bus.list_player_names().await?;
        let mut players = Vec::with_capacity(names.len());
        for name in names {
            if validate_bus_name(&name).is_err() {
                continue;
            }
            match self.bus.load_player(&name).await {
                Ok(mut player) => {
                    match self.bus.name_owner(&name).await {
                        Ok(owner) => {
                            self.owners.insert(owner.clone(), name.clone());
                            player.owner = owner;
                        }
                        Err(e) => log::warn!("[Players] no owner for {name}: {e}"),
                    }
                    self.last_status.insert(name.clone(), player.playback_status);
                    players.push(player);
                }
                Err(e) => log::warn!("[Players] failed to load {name}: {e}"),
            }
        }
        let any_playing = players
            .iter()
            .any(|p| p.playback_status == PlaybackStatus::Playing);
        log::info!("[Players] found {} player(s)", players.len());
        self.cache.set(PLAYERS_KEY, players);

        let signals = self.bus.signals().await?;
        watcher::spawn_watcher(Arc::clone(self), signals);
        if any_playing {
            watcher::ensure_heartbeat(self);
        }
        Ok(())
    }

    /// Stops the watcher tasks and closes the outbound event channel.
    ///
    /// Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        self.events_tx.lock().take();
    }

    /// Hands out the outbound event channel. Yields `Some` exactly once.
    pub fn events(&self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx.lock().take()
    }

    /// Current player enumeration.
    pub fn list(&self) -> Vec<Player> {
        self.cache.get(&PLAYERS_KEY).unwrap_or_default()
    }

    /// Timestamp of the last cache write, for `Last-Modified`.
    pub fn updated_at(&self) -> SystemTime {
        self.cache.updated_at()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────

    /// Invokes a parameterless transport command on a player.
    pub async fn transport(
        &self,
        bus_name: &str,
        command: TransportCommand,
    ) -> CastellanResult<()> {
        validate_bus_name(bus_name)?;
        let player = self.find(bus_name)?;
        let (required, supported) = command.required_capability(&player.capabilities);
        require(required, supported)?;
        self.bus.transport(bus_name, command).await
    }

    /// Seeks by a relative offset in microseconds.
    pub async fn seek(&self, bus_name: &str, offset_us: i64) -> CastellanResult<()> {
        validate_bus_name(bus_name)?;
        let player = self.find(bus_name)?;
        require("CanSeek", player.capabilities.can_seek)?;
        self.bus.seek(bus_name, offset_us).await
    }

    /// Jumps to an absolute position within a track.
    pub async fn set_position(
        &self,
        bus_name: &str,
        track_id: &str,
        position_us: i64,
    ) -> CastellanResult<()> {
        validate_bus_name(bus_name)?;
        if track_id.is_empty() {
            return Err(CastellanError::Validation {
                field: "track_id",
                message: "track id must not be empty".to_string(),
            });
        }
        let player = self.find(bus_name)?;
        require("CanSeek", player.capabilities.can_seek)?;
        self.bus.set_position(bus_name, track_id, position_us).await
    }

    /// Sets the player volume; accepts exactly `[0, 1]`.
    pub async fn set_volume(&self, bus_name: &str, volume: f64) -> CastellanResult<()> {
        validate_bus_name(bus_name)?;
        if !(0.0..=1.0).contains(&volume) {
            return Err(CastellanError::Validation {
                field: "volume",
                message: format!("volume {volume} outside [0, 1]"),
            });
        }
        let player = self.find(bus_name)?;
        require("CanControl", player.capabilities.can_control)?;
        self.bus.set_volume(bus_name, volume).await
    }

    /// Sets the loop mode.
    pub async fn set_loop(&self, bus_name: &str, status: LoopStatus) -> CastellanResult<()> {
        validate_bus_name(bus_name)?;
        let player = self.find(bus_name)?;
        require("CanControl", player.capabilities.can_control)?;
        self.bus.set_loop_status(bus_name, status).await
    }

    /// Sets the shuffle flag.
    pub async fn set_shuffle(&self, bus_name: &str, shuffle: bool) -> CastellanResult<()> {
        validate_bus_name(bus_name)?;
        let player = self.find(bus_name)?;
        require("CanControl", player.capabilities.can_control)?;
        self.bus.set_shuffle(bus_name, shuffle).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cache maintenance (shared by watcher, heartbeat, and tests)
    // ─────────────────────────────────────────────────────────────────────

    fn find(&self, bus_name: &str) -> CastellanResult<Player> {
        self.list()
            .into_iter()
            .find(|p| p.bus_name == bus_name)
            .ok_or_else(|| CastellanError::PlayerNotFound {
                busname: bus_name.to_string(),
            })
    }

    /// Inserts or replaces a player, keeping bus names unique.
    pub(crate) fn upsert_player(&self, player: Player) {
        let mut players = self.list();
        players.retain(|p| p.bus_name != player.bus_name);
        players.push(player);
        self.cache.set(PLAYERS_KEY, players);
    }

    pub(crate) fn remove_player(&self, bus_name: &str) -> Option<Player> {
        let mut players = self.list();
        let removed = players.iter().position(|p| p.bus_name == bus_name)?;
        let player = players.remove(removed);
        self.cache.set(PLAYERS_KEY, players);
        Some(player)
    }

    /// Applies typed property updates to one cached player, in place.
    ///
    /// This is the single update path shared by the signal watcher and the
    /// position heartbeat, so downstream consumers cannot tell them apart.
    pub(crate) fn apply_properties(
        &self,
        bus_name: &str,
        properties: Vec<PlayerProperty>,
    ) -> AppliedUpdate {
        let mut players = self.list();
        let Some(player) = players.iter_mut().find(|p| p.bus_name == bus_name) else {
            return AppliedUpdate::default();
        };

        let mut update = AppliedUpdate::default();
        for property in properties {
            if let PlayerProperty::PlaybackStatus(status) = property {
                let previous = self
                    .last_status
                    .insert(bus_name.to_string(), status)
                    .unwrap_or_default();
                if previous == status {
                    continue;
                }
                if status == PlaybackStatus::Playing {
                    update.started_playing = true;
                }
            }
            mpris::apply_property(player, property);
            update.changed = true;
        }

        if update.changed {
            self.cache.set(PLAYERS_KEY, players);
        }
        update
    }

    /// Resolves a transient sender id to its well-known name.
    pub(crate) fn resolve_owner(&self, sender: &str) -> Option<String> {
        self.owners.get(sender).map(|entry| entry.value().clone())
    }

    pub(crate) async fn emit(&self, event: Event) {
        let sender = self.events_tx.lock().clone();
        if let Some(tx) = sender {
            if tx.send(event).await.is_err() {
                log::debug!("[Players] event channel closed");
            }
        }
    }

    pub(crate) async fn emit_player_updated(&self, bus_name: &str) {
        if let Ok(player) = self.find(bus_name) {
            self.emit(Event::new(EventType::PlayerUpdated, json!(player)))
                .await;
        }
    }

    /// Handles a name-owner change: add, remove, or owner replacement.
    pub(crate) async fn handle_owner_changed(
        self: &Arc<Self>,
        name: String,
        old_owner: String,
        new_owner: String,
    ) {
        if old_owner.is_empty() && !new_owner.is_empty() {
            // A player appeared; fetch the full record.
            match self.bus.load_player(&name).await {
                Ok(mut player) => {
                    self.owners.insert(new_owner.clone(), name.clone());
                    player.owner = new_owner;
                    self.last_status.insert(name.clone(), player.playback_status);
                    if player.playback_status == PlaybackStatus::Playing {
                        watcher::ensure_heartbeat(self);
                    }
                    self.upsert_player(player.clone());
                    self.emit(Event::new(EventType::PlayerAdded, json!(player)))
                        .await;
                    log::info!("[Players] added {name}");
                }
                Err(e) => log::warn!("[Players] failed to load new player {name}: {e}"),
            }
        } else if !old_owner.is_empty() && new_owner.is_empty() {
            self.owners.remove(&old_owner);
            self.last_status.remove(&name);
            if let Some(player) = self.remove_player(&name) {
                self.emit(Event::new(EventType::PlayerRemoved, json!(player)))
                    .await;
                log::info!("[Players] removed {name}");
            }
        } else {
            // Owner replaced in place; refresh the reverse index.
            if !old_owner.is_empty() {
                self.owners.remove(&old_owner);
            }
            if !new_owner.is_empty() {
                self.owners.insert(new_owner.clone(), name.clone());
                let mut players = self.list();
                if let Some(player) = players.iter_mut().find(|p| p.bus_name == name) {
                    player.owner = new_owner;
                    self.cache.set(PLAYERS_KEY, players);
                }
            }
            self.emit_player_updated(&name).await;
        }
    }
}

fn require(capability: &'static str, supported: bool) -> CastellanResult<()> {
    if supported {
        Ok(())
    } else {
        Err(CastellanError::Capability {
            required: capability,
        })
    }
}

/// Validates a player bus name before any network traffic.
///
/// Must be non-empty, start with the well-known prefix followed by a dot,
/// and contain no `..`, `/`, NUL, CR, or LF.
pub fn validate_bus_name(bus_name: &str) -> CastellanResult<()> {
    let reject = |reason| {
        Err(CastellanError::InvalidBusName {
            busname: bus_name.to_string(),
            reason,
        })
    };
    if bus_name.is_empty() {
        return reject("empty bus name");
    }
    if !bus_name.starts_with(PLAYER_BUS_PREFIX)
        || bus_name.as_bytes().get(PLAYER_BUS_PREFIX.len()) != Some(&b'.')
    {
        return reject("missing media player prefix");
    }
    if bus_name.contains("..") {
        return reject("contains '..'");
    }
    if bus_name.contains('/') {
        return reject("contains '/'");
    }
    if bus_name.bytes().any(|b| b == 0 || b == b'\r' || b == b'\n') {
        return reject("contains control bytes");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    /// Recording mock: every outbound call is appended to `calls`.
    #[derive(Default)]
    struct RecordingBus {
        calls: SyncMutex<Vec<String>>,
        player: SyncMutex<Option<Player>>,
    }

    impl RecordingBus {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl PlayerBus for RecordingBus {
        async fn list_player_names(&self) -> CastellanResult<Vec<String>> {
            Ok(vec![])
        }

        async fn name_owner(&self, _bus_name: &str) -> CastellanResult<String> {
            Ok(":1.99".to_string())
        }

        async fn load_player(&self, bus_name: &str) -> CastellanResult<Player> {
            self.player
                .lock()
                .clone()
                .ok_or_else(|| CastellanError::PlayerNotFound {
                    busname: bus_name.to_string(),
                })
        }

        async fn position(&self, bus_name: &str) -> CastellanResult<i64> {
            self.record(format!("position {bus_name}"));
            Ok(0)
        }

        async fn transport(
            &self,
            bus_name: &str,
            command: TransportCommand,
        ) -> CastellanResult<()> {
            self.record(format!("{} {bus_name}", command.method()));
            Ok(())
        }

        async fn seek(&self, bus_name: &str, _offset_us: i64) -> CastellanResult<()> {
            self.record(format!("Seek {bus_name}"));
            Ok(())
        }

        async fn set_position(
            &self,
            bus_name: &str,
            _track_id: &str,
            _position_us: i64,
        ) -> CastellanResult<()> {
            self.record(format!("SetPosition {bus_name}"));
            Ok(())
        }

        async fn set_volume(&self, bus_name: &str, volume: f64) -> CastellanResult<()> {
            self.record(format!("SetVolume {bus_name} {volume}"));
            Ok(())
        }

        async fn set_loop_status(
            &self,
            bus_name: &str,
            _status: LoopStatus,
        ) -> CastellanResult<()> {
            self.record(format!("SetLoopStatus {bus_name}"));
            Ok(())
        }

        async fn set_shuffle(&self, bus_name: &str, _shuffle: bool) -> CastellanResult<()> {
            self.record(format!("SetShuffle {bus_name}"));
            Ok(())
        }

        async fn signals(&self) -> CastellanResult<mpsc::Receiver<PlayerSignal>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    const SPOTIFY: &str = "org.mpris.MediaPlayer2.spotify";

    fn backend_with(bus: Arc<RecordingBus>) -> Arc<PlayersBackend> {
        PlayersBackend::new(
            &MprisConfig::default(),
            bus,
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn cached_player(capabilities: Capabilities) -> Player {
        Player {
            bus_name: SPOTIFY.to_string(),
            identity: "Spotify".to_string(),
            capabilities,
            ..Player::default()
        }
    }

    fn all_capabilities() -> Capabilities {
        Capabilities {
            can_play: true,
            can_pause: true,
            can_go_next: true,
            can_go_previous: true,
            can_seek: true,
            can_control: true,
        }
    }

    #[test]
    fn bus_name_validation_rejects_malformed_names() {
        assert!(validate_bus_name(SPOTIFY).is_ok());
        for bad in [
            "",
            "org.example.Player",
            "org.mpris.MediaPlayer2",
            "org.mpris.MediaPlayer2.a..b",
            "org.mpris.MediaPlayer2.a/b",
            "org.mpris.MediaPlayer2.a\nb",
            "org.mpris.MediaPlayer2.a\rb",
            "org.mpris.MediaPlayer2.a\0b",
        ] {
            assert!(
                matches!(
                    validate_bus_name(bad),
                    Err(CastellanError::InvalidBusName { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn capability_gate_blocks_before_any_outbound_call() {
        let bus = Arc::new(RecordingBus::default());
        let backend = backend_with(Arc::clone(&bus));
        backend.upsert_player(cached_player(Capabilities {
            can_go_next: false,
            ..all_capabilities()
        }));

        let err = backend
            .transport(SPOTIFY, TransportCommand::Next)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CastellanError::Capability { required: "CanGoNext" }
        ));
        assert!(bus.calls().is_empty(), "no outbound call may be issued");
    }

    #[tokio::test]
    async fn volume_accepts_bounds_and_rejects_outside() {
        let bus = Arc::new(RecordingBus::default());
        let backend = backend_with(Arc::clone(&bus));
        backend.upsert_player(cached_player(all_capabilities()));

        backend.set_volume(SPOTIFY, 0.0).await.unwrap();
        backend.set_volume(SPOTIFY, 1.0).await.unwrap();
        assert_eq!(bus.calls().len(), 2);

        for bad in [-0.1, 1.1, f64::NAN] {
            let err = backend.set_volume(SPOTIFY, bad).await.unwrap_err();
            assert!(matches!(
                err,
                CastellanError::Validation { field: "volume", .. }
            ));
        }
        assert_eq!(bus.calls().len(), 2, "rejected values must not reach the bus");
    }

    #[tokio::test]
    async fn set_position_rejects_empty_track_id() {
        let bus = Arc::new(RecordingBus::default());
        let backend = backend_with(Arc::clone(&bus));
        backend.upsert_player(cached_player(all_capabilities()));

        let err = backend.set_position(SPOTIFY, "", 0).await.unwrap_err();
        assert!(matches!(
            err,
            CastellanError::Validation { field: "track_id", .. }
        ));
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_player_yields_not_found() {
        let bus = Arc::new(RecordingBus::default());
        let backend = backend_with(bus);
        let err = backend
            .transport(SPOTIFY, TransportCommand::Play)
            .await
            .unwrap_err();
        assert!(matches!(err, CastellanError::PlayerNotFound { .. }));
    }

    #[tokio::test]
    async fn owner_appearance_adds_player_and_emits() {
        let bus = Arc::new(RecordingBus::default());
        *bus.player.lock() = Some(cached_player(all_capabilities()));
        let backend = backend_with(bus);
        let mut events = backend.events().unwrap();

        backend
            .handle_owner_changed(SPOTIFY.to_string(), String::new(), ":1.42".to_string())
            .await;

        let players = backend.list();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].owner, ":1.42");
        assert_eq!(backend.resolve_owner(":1.42").as_deref(), Some(SPOTIFY));

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::PlayerAdded);
    }

    #[tokio::test]
    async fn owner_disappearance_removes_player_and_emits() {
        let bus = Arc::new(RecordingBus::default());
        *bus.player.lock() = Some(cached_player(all_capabilities()));
        let backend = backend_with(bus);
        let mut events = backend.events().unwrap();

        backend
            .handle_owner_changed(SPOTIFY.to_string(), String::new(), ":1.42".to_string())
            .await;
        backend
            .handle_owner_changed(SPOTIFY.to_string(), ":1.42".to_string(), String::new())
            .await;

        assert!(backend.list().is_empty());
        assert!(backend.resolve_owner(":1.42").is_none());

        let added = events.recv().await.unwrap();
        assert_eq!(added.event_type, EventType::PlayerAdded);
        let removed = events.recv().await.unwrap();
        assert_eq!(removed.event_type, EventType::PlayerRemoved);
    }

    #[tokio::test]
    async fn repeated_status_is_deduplicated() {
        let bus = Arc::new(RecordingBus::default());
        let backend = backend_with(bus);
        backend.upsert_player(cached_player(all_capabilities()));

        let first = backend.apply_properties(
            SPOTIFY,
            vec![PlayerProperty::PlaybackStatus(PlaybackStatus::Playing)],
        );
        assert!(first.changed);
        assert!(first.started_playing);

        let second = backend.apply_properties(
            SPOTIFY,
            vec![PlayerProperty::PlaybackStatus(PlaybackStatus::Playing)],
        );
        assert!(!second.changed);
        assert!(!second.started_playing);
    }
}
