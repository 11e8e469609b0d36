//! Native-protocol implementation of [`AudioServer`].
//!
//! The protocol library is callback-driven, so one dedicated thread owns
//! the mainloop and context per session and serves requests sent over a
//! channel; replies travel back on oneshot channels. Rc<RefCell> is safe
//! here because the whole session runs on that single thread and all
//! callbacks execute during `mainloop.iterate()`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::mpsc::{Receiver as StdReceiver, Sender as StdSender, TryRecvError};
use std::time::Duration;

use async_trait::async_trait;
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::introspect::{
    ModuleInfo as PaModuleInfo, ServerInfo as PaServerInfo, SinkInfo as PaSinkInfo,
    SinkInputInfo as PaSinkInputInfo, SourceInfo as PaSourceInfo,
};
use libpulse_binding::context::subscribe::InterestMaskSet;
use libpulse_binding::context::{Context, FlagSet, State};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_binding::volume::{ChannelVolumes, Volume, VolumeLinear};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::config::PulseaudioConfig;
use crate::error::{CastellanError, CastellanResult};
use crate::utils;

use super::bus::AudioServer;
use super::types::{AudioServerInfo, ModuleInfo, ServerKind, SinkInput, SinkState, SourceInfo};

/// How long one request may wait for the session thread.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Reply<T> = oneshot::Sender<Result<T, String>>;

enum PulseRequest {
    ServerInfo {
        reply: Reply<AudioServerInfo>,
    },
    SinkInputs {
        reply: Reply<Vec<SinkInput>>,
    },
    Module {
        index: u32,
        reply: Reply<ModuleInfo>,
    },
    SourceByName {
        name: String,
        reply: Reply<SourceInfo>,
    },
    SinkByName {
        name: String,
        reply: Reply<SinkState>,
    },
    SetSinkVolume {
        name: String,
        volume: f64,
        reply: Reply<()>,
    },
    SetSinkMute {
        name: String,
        mute: bool,
        reply: Reply<()>,
    },
    SetSinkInputVolume {
        index: u32,
        channels: u8,
        volume: f64,
        reply: Reply<()>,
    },
    SetSinkInputMute {
        index: u32,
        mute: bool,
        reply: Reply<()>,
    },
}

/// Client for the audio server's native socket.
pub struct PulseClient {
    requests: Mutex<StdSender<PulseRequest>>,
    notify_tx: mpsc::UnboundedSender<()>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    server: String,
    timeout: Duration,
}

impl PulseClient {
    /// Connects to `$XDG_RUNTIME_DIR/pulse/native` (or the configured
    /// override) and verifies liveness with one round trip.
    pub async fn connect(config: &PulseaudioConfig) -> CastellanResult<Self> {
        let runtime = utils::runtime_dir(config.xdg_runtime_dir.as_deref());
        let server = format!("unix:{runtime}/pulse/native");
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = std::sync::mpsc::channel();

        spawn_session(server.clone(), request_rx, notify_tx.clone());

        let client = Self {
            requests: Mutex::new(request_tx),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            server,
            timeout: REQUEST_TIMEOUT,
        };
        client.ping().await?;
        Ok(client)
    }

    fn sender(&self) -> StdSender<PulseRequest> {
        self.requests.lock().clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> PulseRequest,
    ) -> CastellanResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender()
            .send(build(tx))
            .map_err(|_| CastellanError::Upstream("audio server session closed".to_string()))?;
        match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => Err(CastellanError::Timeout),
            Ok(Err(_)) => Err(CastellanError::Upstream(
                "audio server dropped the request".to_string(),
            )),
            Ok(Ok(result)) => result.map_err(CastellanError::Upstream),
        }
    }
}

#[async_trait]
impl AudioServer for PulseClient {
    async fn server_info(&self) -> CastellanResult<AudioServerInfo> {
        self.request(|reply| PulseRequest::ServerInfo { reply }).await
    }

    async fn sink_inputs(&self) -> CastellanResult<Vec<SinkInput>> {
        self.request(|reply| PulseRequest::SinkInputs { reply }).await
    }

    async fn module(&self, index: u32) -> CastellanResult<ModuleInfo> {
        self.request(|reply| PulseRequest::Module { index, reply })
            .await
    }

    async fn source_by_name(&self, name: &str) -> CastellanResult<SourceInfo> {
        let name = name.to_string();
        self.request(|reply| PulseRequest::SourceByName { name, reply })
            .await
    }

    async fn sink_by_name(&self, name: &str) -> CastellanResult<SinkState> {
        let name = name.to_string();
        self.request(|reply| PulseRequest::SinkByName { name, reply })
            .await
    }

    async fn set_sink_volume(&self, name: &str, volume: f64) -> CastellanResult<()> {
        let name = name.to_string();
        self.request(|reply| PulseRequest::SetSinkVolume { name, volume, reply })
            .await
    }

    async fn set_sink_mute(&self, name: &str, mute: bool) -> CastellanResult<()> {
        let name = name.to_string();
        self.request(|reply| PulseRequest::SetSinkMute { name, mute, reply })
            .await
    }

    async fn set_sink_input_volume(
        &self,
        index: u32,
        channels: u8,
        volume: f64,
    ) -> CastellanResult<()> {
        self.request(|reply| PulseRequest::SetSinkInputVolume {
            index,
            channels,
            volume,
            reply,
        })
        .await
    }

    async fn set_sink_input_mute(&self, index: u32, mute: bool) -> CastellanResult<()> {
        self.request(|reply| PulseRequest::SetSinkInputMute { index, mute, reply })
            .await
    }

    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.notify_rx.lock().take()
    }

    async fn ping(&self) -> CastellanResult<()> {
        self.server_info().await.map(|_| ())
    }

    async fn reconnect(&self) -> CastellanResult<()> {
        let (request_tx, request_rx) = std::sync::mpsc::channel();
        spawn_session(self.server.clone(), request_rx, self.notify_tx.clone());
        // Dropping the old sender disconnects the previous session thread.
        *self.requests.lock() = request_tx;
        self.ping().await
    }
}

fn spawn_session(
    server: String,
    requests: StdReceiver<PulseRequest>,
    notify: mpsc::UnboundedSender<()>,
) {
    let spawned = std::thread::Builder::new()
        .name("pulse-session".to_string())
        .spawn(move || {
            log::debug!("[Audio] session connecting to {server}");
            match run_session(&server, requests, notify) {
                Ok(()) => log::debug!("[Audio] session closed"),
                Err(e) => log::warn!("[Audio] session ended: {e}"),
            }
        });
    if let Err(e) = spawned {
        log::error!("[Audio] failed to spawn session thread: {e}");
    }
}

/// Runs one connection lifetime on the current thread.
///
/// Returns `Ok` when the request channel disconnects (clean teardown) and
/// `Err` when the connection is lost.
fn run_session(
    server: &str,
    requests: StdReceiver<PulseRequest>,
    notify: mpsc::UnboundedSender<()>,
) -> Result<(), String> {
    let mut proplist = Proplist::new().ok_or("failed to create proplist")?;
    proplist
        .set_str(properties::APPLICATION_NAME, "castellan")
        .map_err(|_| "failed to set application name")?;

    let mut mainloop = Mainloop::new().ok_or("failed to create mainloop")?;
    let mut context = Context::new_with_proplist(&mainloop, "castellan", &proplist)
        .ok_or("failed to create context")?;
    context
        .connect(Some(server), FlagSet::NOFLAGS, None)
        .map_err(|e| format!("connect failed: {e}"))?;

    // Drive the loop until the context settles.
    loop {
        iterate(&mut mainloop)?;
        match context.get_state() {
            State::Ready => break,
            State::Failed | State::Terminated => {
                return Err("connection refused by the audio server".to_string());
            }
            _ => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    log::info!("[Audio] connected to {server}");

    // Sink-input change notifications; payload content is irrelevant, a
    // ping just means "re-enumerate".
    context.set_subscribe_callback(Some(Box::new(move |_facility, _operation, _index| {
        let _ = notify.send(());
    })));
    context.subscribe(InterestMaskSet::SINK_INPUT, |_success| {});

    loop {
        iterate(&mut mainloop)?;
        if matches!(context.get_state(), State::Failed | State::Terminated) {
            return Err("connection lost".to_string());
        }
        match requests.try_recv() {
            Ok(request) => handle_request(&mut context, request),
            Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(5)),
            Err(TryRecvError::Disconnected) => return Ok(()),
        }
    }
}

fn iterate(mainloop: &mut Mainloop) -> Result<(), String> {
    match mainloop.iterate(false) {
        IterateResult::Success(_) => Ok(()),
        IterateResult::Quit(_) => Err("mainloop quit".to_string()),
        IterateResult::Err(e) => Err(format!("mainloop error: {e}")),
    }
}

fn handle_request(context: &mut Context, request: PulseRequest) {
    let mut introspect = context.introspect();
    match request {
        PulseRequest::ServerInfo { reply } => {
            let reply = Rc::new(RefCell::new(Some(reply)));
            introspect.get_server_info(move |info: &PaServerInfo| {
                if let Some(tx) = reply.borrow_mut().take() {
                    let _ = tx.send(Ok(convert_server_info(info)));
                }
            });
        }
        PulseRequest::SinkInputs { reply } => {
            let rows = Rc::new(RefCell::new(Vec::new()));
            let reply = Rc::new(RefCell::new(Some(reply)));
            introspect.get_sink_input_info_list(move |result| match result {
                ListResult::Item(info) => rows.borrow_mut().push(convert_sink_input(info)),
                ListResult::End => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Ok(rows.borrow_mut().drain(..).collect()));
                    }
                }
                ListResult::Error => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Err("sink input listing failed".to_string()));
                    }
                }
            });
        }
        PulseRequest::Module { index, reply } => {
            let reply = Rc::new(RefCell::new(Some(reply)));
            introspect.get_module_info(index, move |result| match result {
                ListResult::Item(info) => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Ok(convert_module(info)));
                    }
                }
                ListResult::End => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Err(format!("module {index} not found")));
                    }
                }
                ListResult::Error => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Err(format!("module {index} lookup failed")));
                    }
                }
            });
        }
        PulseRequest::SourceByName { name, reply } => {
            let reply = Rc::new(RefCell::new(Some(reply)));
            let wanted = name.clone();
            introspect.get_source_info_by_name(&name, move |result| match result {
                ListResult::Item(info) => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Ok(convert_source(info)));
                    }
                }
                ListResult::End => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Err(format!("source {wanted} not found")));
                    }
                }
                ListResult::Error => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Err(format!("source {wanted} lookup failed")));
                    }
                }
            });
        }
        PulseRequest::SinkByName { name, reply } => {
            let reply = Rc::new(RefCell::new(Some(reply)));
            let wanted = name.clone();
            introspect.get_sink_info_by_name(&name, move |result| match result {
                ListResult::Item(info) => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Ok(convert_sink(info)));
                    }
                }
                ListResult::End => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Err(format!("sink {wanted} not found")));
                    }
                }
                ListResult::Error => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Err(format!("sink {wanted} lookup failed")));
                    }
                }
            });
        }
        PulseRequest::SetSinkVolume { name, volume, reply } => {
            // The channel count is only known from the sink itself, so read
            // it first and write the volume from inside the callback.
            let reply = Rc::new(RefCell::new(Some(reply)));
            let mut follow = context.introspect();
            let wanted = name.clone();
            introspect.get_sink_info_by_name(&name, move |result| match result {
                ListResult::Item(info) => {
                    let mut volumes = ChannelVolumes::default();
                    volumes.set(info.volume.len(), Volume::from(VolumeLinear(volume)));
                    let sink = wanted.clone();
                    let done = Rc::clone(&reply);
                    follow.set_sink_volume_by_name(
                        &sink,
                        &volumes,
                        Some(Box::new(move |success| {
                            if let Some(tx) = done.borrow_mut().take() {
                                let _ = tx.send(ack(success, "set sink volume"));
                            }
                        })),
                    );
                }
                ListResult::End => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Err(format!("sink {wanted} not found")));
                    }
                }
                ListResult::Error => {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(Err(format!("sink {wanted} lookup failed")));
                    }
                }
            });
        }
        PulseRequest::SetSinkMute { name, mute, reply } => {
            let reply = Rc::new(RefCell::new(Some(reply)));
            introspect.set_sink_mute_by_name(
                &name,
                mute,
                Some(Box::new(move |success| {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(ack(success, "set sink mute"));
                    }
                })),
            );
        }
        PulseRequest::SetSinkInputVolume {
            index,
            channels,
            volume,
            reply,
        } => {
            let reply = Rc::new(RefCell::new(Some(reply)));
            let mut volumes = ChannelVolumes::default();
            volumes.set(channels.max(1), Volume::from(VolumeLinear(volume)));
            introspect.set_sink_input_volume(
                index,
                &volumes,
                Some(Box::new(move |success| {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(ack(success, "set sink input volume"));
                    }
                })),
            );
        }
        PulseRequest::SetSinkInputMute { index, mute, reply } => {
            let reply = Rc::new(RefCell::new(Some(reply)));
            introspect.set_sink_input_mute(
                index,
                mute,
                Some(Box::new(move |success| {
                    if let Some(tx) = reply.borrow_mut().take() {
                        let _ = tx.send(ack(success, "set sink input mute"));
                    }
                })),
            );
        }
    }
}

fn ack(success: bool, action: &str) -> Result<(), String> {
    if success {
        Ok(())
    } else {
        Err(format!("{action} rejected by the audio server"))
    }
}

fn convert_server_info(info: &PaServerInfo) -> AudioServerInfo {
    let server_name = info
        .server_name
        .as_ref()
        .map(|name| name.to_string())
        .unwrap_or_default();
    let kind = if server_name.contains("PipeWire") {
        ServerKind::Pipewire
    } else {
        ServerKind::Pulseaudio
    };
    AudioServerInfo {
        kind,
        server_name,
        server_version: info
            .server_version
            .as_ref()
            .map(|version| version.to_string())
            .unwrap_or_default(),
        default_sink: info
            .default_sink_name
            .as_ref()
            .map(|name| name.to_string())
            .unwrap_or_default(),
    }
}

fn convert_sink_input(info: &PaSinkInputInfo) -> SinkInput {
    let mut props = BTreeMap::new();
    for key in info.proplist.iter() {
        if let Some(value) = info.proplist.get_str(&key) {
            props.insert(key, value);
        }
    }
    SinkInput {
        index: info.index,
        name: info
            .name
            .as_ref()
            .map(|name| name.to_string())
            .unwrap_or_default(),
        owner_module: info.owner_module,
        volume: VolumeLinear::from(info.volume.avg()).0,
        muted: info.mute,
        corked: info.corked,
        channels: info.volume.len(),
        properties: props,
    }
}

fn convert_module(info: &PaModuleInfo) -> ModuleInfo {
    ModuleInfo {
        index: info.index,
        name: info
            .name
            .as_ref()
            .map(|name| name.to_string())
            .unwrap_or_default(),
        argument: info
            .argument
            .as_ref()
            .map(|argument| argument.to_string())
            .unwrap_or_default(),
    }
}

fn convert_source(info: &PaSourceInfo) -> SourceInfo {
    SourceInfo {
        index: info.index,
        name: info
            .name
            .as_ref()
            .map(|name| name.to_string())
            .unwrap_or_default(),
        description: info
            .description
            .as_ref()
            .map(|description| description.to_string())
            .unwrap_or_default(),
    }
}

fn convert_sink(info: &PaSinkInfo) -> SinkState {
    SinkState {
        name: info
            .name
            .as_ref()
            .map(|name| name.to_string())
            .unwrap_or_default(),
        volume: VolumeLinear::from(info.volume.avg()).0,
        muted: info.mute,
    }
}
