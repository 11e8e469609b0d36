//! Audio backend.
//!
//! Owns the native audio-server connection, a cache of the current
//! sink-input enumeration, and the watcher keeping it current. The only
//! backend with a hot reconnect loop: liveness is checked every two
//! seconds and lost connections are re-established with exponential
//! backoff until cancellation.

mod bus;
pub mod pulse;
pub mod types;

pub use bus::AudioServer;
pub use pulse::PulseClient;
pub use types::{AudioClient, AudioServerInfo, ModuleInfo, ServerKind, SinkInput, SinkState, SourceInfo};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::config::PulseaudioConfig;
use crate::error::{CastellanError, CastellanResult};
use crate::events::{Event, EventType, BACKEND_CHANNEL_CAPACITY};

const CLIENTS_KEY: &str = "clients";

/// Liveness check interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Reconnect backoff bounds.
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Property signature of a bluetooth loopback stream.
const BLUETOOTH_ICON: &str = "audio-card-bluetooth";
const LOOPBACK_NAME_PREFIX: &str = "Loopback from ";
const LOOPBACK_MODULE: &str = "module-loopback";

/// Backend for audio-sink control and observation.
pub struct AudioBackend {
    server: Arc<dyn AudioServer>,
    cache: TtlCache<&'static str, Vec<AudioClient>>,
    info: RwLock<Option<AudioServerInfo>>,
    events_tx: Mutex<Option<mpsc::Sender<Event>>>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    cancel: CancellationToken,
}

impl AudioBackend {
    /// Creates the backend, or `None` when disabled by configuration.
    pub fn new(
        config: &PulseaudioConfig,
        server: Arc<dyn AudioServer>,
        cancel: CancellationToken,
    ) -> Option<Arc<Self>> {
        if !config.enabled {
            return None;
        }
        let (tx, rx) = mpsc::channel(BACKEND_CHANNEL_CAPACITY);
        Some(Arc::new(Self {
            server,
            cache: TtlCache::new(Duration::ZERO),
            info: RwLock::new(None),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            cancel,
        }))
    }

    /// Reads server metadata, enumerates clients, and starts the watcher
    /// and liveness supervisor.
    pub async fn start(self: &Arc<Self>) -> CastellanResult<()> {
        let info = self.server.server_info().await?;
        log::info!(
            "[Audio] connected to {} {} ({:?})",
            info.server_name,
            info.server_version,
            info.kind
        );
        *self.info.write() = Some(info);
        self.refresh_clients().await?;

        if let Some(notifications) = self.server.notifications() {
            spawn_watcher(Arc::clone(self), notifications);
        }
        spawn_supervisor(Arc::clone(self));
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

    // ─────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────

    /// Metadata of the connected server.
    pub fn server_info(&self) -> CastellanResult<AudioServerInfo> {
        self.info
            .read()
            .clone()
            .ok_or_else(|| CastellanError::Upstream("audio server not connected".to_string()))
    }

    /// Current client enumeration.
    pub fn list_clients(&self) -> Vec<AudioClient> {
        self.cache.get(&CLIENTS_KEY).unwrap_or_default()
    }

    /// Timestamp of the last cache write, for `Last-Modified`.
    pub fn updated_at(&self) -> SystemTime {
        self.cache.updated_at()
    }

    /// Toggles mute on the default sink.
    pub async fn toggle_mute_master(&self) -> CastellanResult<()> {
        let info = self.server_info()?;
        let sink = self.server.sink_by_name(&info.default_sink).await?;
        self.server
            .set_sink_mute(&info.default_sink, !sink.muted)
            .await
    }

    /// Sets the default sink volume; accepts exactly `[0, 1]`.
    pub async fn set_volume_master(&self, volume: f64) -> CastellanResult<()> {
        validate_volume(volume)?;
        let info = self.server_info()?;
        self.server.set_sink_volume(&info.default_sink, volume).await
    }

    /// Toggles mute on one client, resolved by stream name.
    pub async fn toggle_mute(&self, name: &str) -> CastellanResult<()> {
        let client = self.find_client(name)?;
        self.server
            .set_sink_input_mute(client.id, !client.muted)
            .await
    }

    /// Sets one client's volume, resolved by stream name.
    pub async fn set_volume(&self, name: &str, volume: f64) -> CastellanResult<()> {
        validate_volume(volume)?;
        let client = self.find_client(name)?;
        self.server
            .set_sink_input_volume(client.id, client.channels, volume)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Enumeration & diff
    // ─────────────────────────────────────────────────────────────────────

    fn find_client(&self, name: &str) -> CastellanResult<AudioClient> {
        self.list_clients()
            .into_iter()
            .find(|client| client.name == name)
            .ok_or_else(|| CastellanError::ClientNotFound {
                name: name.to_string(),
            })
    }

    /// Fetches all sink inputs, derives clients, merges against the cache,
    /// and emits `audio.updated` on any structural change.
    pub(crate) async fn refresh_clients(&self) -> CastellanResult<()> {
        let kind = self
            .info
            .read()
            .as_ref()
            .map(|info| info.kind)
            .unwrap_or(ServerKind::Pulseaudio);
        let inputs = self.server.sink_inputs().await?;
        let mut next = Vec::with_capacity(inputs.len());
        for input in inputs {
            next.push(self.derive_client(input, kind).await);
        }
        if self.merge_clients(next) {
            let clients = self.list_clients();
            self.emit(Event::new(EventType::AudioUpdated, json!(clients)))
                .await;
        }
        Ok(())
    }

    /// Re-reads server metadata and the enumeration after a reconnect.
    pub(crate) async fn resync(&self) -> CastellanResult<()> {
        let info = self.server.server_info().await?;
        *self.info.write() = Some(info);
        self.refresh_clients().await
    }

    /// Builds an [`AudioClient`] from a raw sink-input row.
    ///
    /// Bluetooth loopback streams expose a synthetic name; rewrite them to
    /// the upstream device's identity when the owner module can tell us.
    async fn derive_client(&self, input: SinkInput, kind: ServerKind) -> AudioClient {
        let loopback = is_bluetooth_loopback(&input);
        let origin = if loopback {
            self.loopback_origin(&input).await
        } else {
            None
        };

        let mut client = AudioClient {
            id: input.index,
            name: input.name.clone(),
            host: input
                .properties
                .get("application.name")
                .cloned()
                .unwrap_or_default(),
            binary: input
                .properties
                .get("application.process.binary")
                .cloned()
                .unwrap_or_default(),
            muted: input.muted,
            volume: input.volume,
            corked: input.corked,
            server: kind,
            channels: input.channels,
            properties: input.properties,
        };

        if loopback {
            match origin {
                Some(description) => {
                    client.name = description.clone();
                    client.host = description.clone();
                    client.binary = description;
                }
                None => {
                    client.name = client
                        .name
                        .strip_prefix(LOOPBACK_NAME_PREFIX)
                        .unwrap_or(&client.name)
                        .to_string();
                }
            }
        }
        client
    }

    /// Resolves a loopback stream to its source's device description.
    async fn loopback_origin(&self, input: &SinkInput) -> Option<String> {
        let module_index = input.owner_module?;
        let module = match self.server.module(module_index).await {
            Ok(module) => module,
            Err(e) => {
                log::debug!("[Audio] owner module {module_index} lookup failed: {e}");
                return None;
            }
        };
        if module.name != LOOPBACK_MODULE {
            return None;
        }
        let source_name = parse_module_source(&module.argument)?;
        let source = match self.server.source_by_name(&source_name).await {
            Ok(source) => source,
            Err(e) => {
                log::debug!("[Audio] loopback source {source_name} lookup failed: {e}");
                return None;
            }
        };
        (!source.description.is_empty()).then_some(source.description)
    }

    /// Merges a fresh enumeration against the cache, keyed by client name.
    ///
    /// Existing entries are replaced only when [`client_changed`]; missing
    /// names are dropped, new names added. Returns whether anything
    /// structurally changed, which is exactly the emit policy.
    pub(crate) fn merge_clients(&self, next: Vec<AudioClient>) -> bool {
        let previous = self.list_clients();
        let mut changed = next.len() != previous.len();
        let by_name: HashMap<&str, &AudioClient> = previous
            .iter()
            .map(|client| (client.name.as_str(), client))
            .collect();

        let mut merged = Vec::with_capacity(next.len());
        for client in next {
            match by_name.get(client.name.as_str()) {
                Some(existing) if !client_changed(existing, &client) => {
                    merged.push((*existing).clone());
                }
                Some(_) => {
                    changed = true;
                    merged.push(client);
                }
                None => {
                    changed = true;
                    merged.push(client);
                }
            }
        }
        self.cache.set(CLIENTS_KEY, merged);
        changed
    }

    pub(crate) async fn emit(&self, event: Event) {
        let sender = self.events_tx.lock().clone();
        if let Some(tx) = sender {
            if tx.send(event).await.is_err() {
                log::debug!("[Audio] event channel closed");
            }
        }
    }
}

/// Whether two snapshots of the same client differ in any of the mutable
/// attributes (volume, muted, corked).
pub(crate) fn client_changed(previous: &AudioClient, current: &AudioClient) -> bool {
    previous.volume != current.volume
        || previous.muted != current.muted
        || previous.corked != current.corked
}

fn is_bluetooth_loopback(input: &SinkInput) -> bool {
    input
        .properties
        .get("media.icon_name")
        .is_some_and(|icon| icon == BLUETOOTH_ICON)
        && input.name.starts_with(LOOPBACK_NAME_PREFIX)
}

/// Extracts `source=<name>` from a module argument string.
fn parse_module_source(argument: &str) -> Option<String> {
    argument
        .split_whitespace()
        .find_map(|part| part.strip_prefix("source="))
        .map(|name| name.trim_matches('"').to_string())
}

fn validate_volume(volume: f64) -> CastellanResult<()> {
    if (0.0..=1.0).contains(&volume) {
        Ok(())
    } else {
        Err(CastellanError::Validation {
            field: "volume",
            message: format!("volume {volume} outside [0, 1]"),
        })
    }
}

fn spawn_watcher(backend: Arc<AudioBackend>, mut notifications: mpsc::UnboundedReceiver<()>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = backend.cancel.cancelled() => break,
                ping = notifications.recv() => {
                    match ping {
                        Some(()) => {
                            if let Err(e) = backend.refresh_clients().await {
                                log::warn!("[Audio] refresh failed: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        log::debug!("[Audio] watcher stopped");
    });
}

/// Liveness supervisor: pings every two seconds and, on loss, reconnects
/// with exponential backoff (1 s doubling to a 30 s cap) until cancelled.
fn spawn_supervisor(backend: Arc<AudioBackend>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = backend.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if backend.server.ping().await.is_ok() {
                        continue;
                    }
                    log::warn!("[Audio] connection lost, entering reconnect loop");
                    let mut delay = RECONNECT_INITIAL;
                    loop {
                        tokio::select! {
                            _ = backend.cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        match backend.server.reconnect().await {
                            Ok(()) => {
                                log::info!("[Audio] reconnected");
                                if let Err(e) = backend.resync().await {
                                    log::warn!("[Audio] resync after reconnect failed: {e}");
                                }
                                break;
                            }
                            Err(e) => {
                                log::warn!("[Audio] reconnect failed: {e}");
                                delay = (delay * 2).min(RECONNECT_CAP);
                            }
                        }
                    }
                }
            }
        }
        log::debug!("[Audio] supervisor stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct ScriptedServer {
        inputs: SyncMutex<Vec<SinkInput>>,
        module: SyncMutex<Option<ModuleInfo>>,
        source: SyncMutex<Option<SourceInfo>>,
        sink: SyncMutex<SinkState>,
        calls: SyncMutex<Vec<String>>,
    }

    impl ScriptedServer {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }
    }

    #[async_trait]
    impl AudioServer for ScriptedServer {
        async fn server_info(&self) -> CastellanResult<AudioServerInfo> {
            Ok(AudioServerInfo {
                kind: ServerKind::Pulseaudio,
                server_name: "pulseaudio".to_string(),
                server_version: "17.0".to_string(),
                default_sink: "alsa_output.default".to_string(),
            })
        }

        async fn sink_inputs(&self) -> CastellanResult<Vec<SinkInput>> {
            Ok(self.inputs.lock().clone())
        }

        async fn module(&self, index: u32) -> CastellanResult<ModuleInfo> {
            self.module
                .lock()
                .clone()
                .ok_or_else(|| CastellanError::Upstream(format!("module {index} not found")))
        }

        async fn source_by_name(&self, name: &str) -> CastellanResult<SourceInfo> {
            self.source
                .lock()
                .clone()
                .ok_or_else(|| CastellanError::Upstream(format!("source {name} not found")))
        }

        async fn sink_by_name(&self, _name: &str) -> CastellanResult<SinkState> {
            Ok(self.sink.lock().clone())
        }

        async fn set_sink_volume(&self, name: &str, volume: f64) -> CastellanResult<()> {
            self.record(format!("sink_volume {name} {volume}"));
            Ok(())
        }

        async fn set_sink_mute(&self, name: &str, mute: bool) -> CastellanResult<()> {
            self.record(format!("sink_mute {name} {mute}"));
            Ok(())
        }

        async fn set_sink_input_volume(
            &self,
            index: u32,
            _channels: u8,
            volume: f64,
        ) -> CastellanResult<()> {
            self.record(format!("input_volume {index} {volume}"));
            Ok(())
        }

        async fn set_sink_input_mute(&self, index: u32, mute: bool) -> CastellanResult<()> {
            self.record(format!("input_mute {index} {mute}"));
            Ok(())
        }

        fn notifications(&self) -> Option<mpsc::UnboundedReceiver<()>> {
            None
        }

        async fn ping(&self) -> CastellanResult<()> {
            Ok(())
        }

        async fn reconnect(&self) -> CastellanResult<()> {
            Ok(())
        }
    }

    fn backend_with(server: Arc<ScriptedServer>) -> Arc<AudioBackend> {
        let backend = AudioBackend::new(
            &PulseaudioConfig::default(),
            server,
            CancellationToken::new(),
        )
        .unwrap();
        *backend.info.write() = Some(AudioServerInfo {
            kind: ServerKind::Pulseaudio,
            server_name: "pulseaudio".to_string(),
            server_version: "17.0".to_string(),
            default_sink: "alsa_output.default".to_string(),
        });
        backend
    }

    fn spotify_input() -> SinkInput {
        let mut properties = BTreeMap::new();
        properties.insert("application.name".to_string(), "Spotify".to_string());
        properties.insert(
            "application.process.binary".to_string(),
            "spotify".to_string(),
        );
        SinkInput {
            index: 7,
            name: "Spotify".to_string(),
            owner_module: None,
            volume: 0.8,
            muted: false,
            corked: false,
            channels: 2,
            properties,
        }
    }

    fn loopback_input() -> SinkInput {
        let mut properties = BTreeMap::new();
        properties.insert(
            "media.icon_name".to_string(),
            BLUETOOTH_ICON.to_string(),
        );
        SinkInput {
            index: 9,
            name: "Loopback from Pixel 8".to_string(),
            owner_module: Some(3),
            volume: 1.0,
            muted: false,
            corked: false,
            channels: 2,
            properties,
        }
    }

    #[test]
    fn client_changed_is_any_differ() {
        let backend = backend_with(Arc::new(ScriptedServer::default()));
        let base = futures::executor::block_on(
            backend.derive_client(spotify_input(), ServerKind::Pulseaudio),
        );

        let same = base.clone();
        assert!(!client_changed(&base, &same));

        let mut volume = base.clone();
        volume.volume = 0.5;
        assert!(client_changed(&base, &volume));

        let mut muted = base.clone();
        muted.muted = true;
        assert!(client_changed(&base, &muted));

        let mut corked = base.clone();
        corked.corked = true;
        assert!(client_changed(&base, &corked));
    }

    #[tokio::test]
    async fn refresh_emits_only_on_structural_change() {
        let server = Arc::new(ScriptedServer::default());
        *server.inputs.lock() = vec![spotify_input()];
        let backend = backend_with(Arc::clone(&server));
        let mut events = backend.events().unwrap();

        // First load: empty cache -> populated.
        backend.refresh_clients().await.unwrap();
        assert_eq!(events.recv().await.unwrap().event_type, EventType::AudioUpdated);

        // Identical enumeration: no event.
        backend.refresh_clients().await.unwrap();
        assert!(events.try_recv().is_err());

        // Volume change: event.
        server.inputs.lock()[0].volume = 0.3;
        backend.refresh_clients().await.unwrap();
        assert_eq!(events.recv().await.unwrap().event_type, EventType::AudioUpdated);

        // Stream disappears: event.
        server.inputs.lock().clear();
        backend.refresh_clients().await.unwrap();
        assert_eq!(events.recv().await.unwrap().event_type, EventType::AudioUpdated);
        assert!(backend.list_clients().is_empty());
    }

    #[tokio::test]
    async fn loopback_stream_is_rewritten_to_device_description() {
        let server = Arc::new(ScriptedServer::default());
        *server.module.lock() = Some(ModuleInfo {
            index: 3,
            name: LOOPBACK_MODULE.to_string(),
            argument: "source=bluez_source.AA_BB source_dont_move=true".to_string(),
        });
        *server.source.lock() = Some(SourceInfo {
            index: 12,
            name: "bluez_source.AA_BB".to_string(),
            description: "Pixel 8".to_string(),
        });
        *server.inputs.lock() = vec![loopback_input()];
        let backend = backend_with(server);

        backend.refresh_clients().await.unwrap();
        let clients = backend.list_clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "Pixel 8");
        assert_eq!(clients[0].host, "Pixel 8");
        assert_eq!(clients[0].binary, "Pixel 8");
    }

    #[tokio::test]
    async fn loopback_without_module_falls_back_to_stripped_name() {
        let server = Arc::new(ScriptedServer::default());
        *server.inputs.lock() = vec![loopback_input()];
        let backend = backend_with(server);

        backend.refresh_clients().await.unwrap();
        let clients = backend.list_clients();
        assert_eq!(clients[0].name, "Pixel 8");
    }

    #[tokio::test]
    async fn master_volume_validates_range() {
        let server = Arc::new(ScriptedServer::default());
        let backend = backend_with(Arc::clone(&server));

        backend.set_volume_master(1.0).await.unwrap();
        let err = backend.set_volume_master(1.5).await.unwrap_err();
        assert!(matches!(
            err,
            CastellanError::Validation { field: "volume", .. }
        ));
        assert_eq!(server.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn per_client_operations_resolve_by_name() {
        let server = Arc::new(ScriptedServer::default());
        *server.inputs.lock() = vec![spotify_input()];
        let backend = backend_with(Arc::clone(&server));
        backend.refresh_clients().await.unwrap();

        backend.set_volume("Spotify", 0.4).await.unwrap();
        backend.toggle_mute("Spotify").await.unwrap();
        assert_eq!(
            server.calls.lock().clone(),
            vec!["input_volume 7 0.4", "input_mute 7 true"]
        );

        let err = backend.toggle_mute("Nope").await.unwrap_err();
        assert!(matches!(err, CastellanError::ClientNotFound { .. }));
    }

    #[test]
    fn module_source_argument_parsing() {
        assert_eq!(
            parse_module_source("source=bluez_source.X rate=44100"),
            Some("bluez_source.X".to_string())
        );
        assert_eq!(
            parse_module_source("source=\"quoted.name\""),
            Some("quoted.name".to_string())
        );
        assert_eq!(parse_module_source("sink=foo"), None);
    }
}
