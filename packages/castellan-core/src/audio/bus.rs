//! Trait abstraction for native audio-server operations.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CastellanResult;

use super::types::{AudioServerInfo, ModuleInfo, SinkInput, SinkState, SourceInfo};

/// Native-protocol primitives against the audio server.
///
/// One implementation wraps one connection; the backend's supervisor calls
/// [`reconnect`] after liveness loss and re-enumerates.
///
/// [`reconnect`]: AudioServer::reconnect
#[async_trait]
pub trait AudioServer: Send + Sync {
    /// Reads server metadata, identifying pulseaudio vs pipewire.
    async fn server_info(&self) -> CastellanResult<AudioServerInfo>;

    /// Lists all current sink inputs.
    async fn sink_inputs(&self) -> CastellanResult<Vec<SinkInput>>;

    /// Looks up one loaded module by index.
    async fn module(&self, index: u32) -> CastellanResult<ModuleInfo>;

    /// Looks up a source by name.
    async fn source_by_name(&self, name: &str) -> CastellanResult<SourceInfo>;

    /// Reads a sink's current volume and mute state.
    async fn sink_by_name(&self, name: &str) -> CastellanResult<SinkState>;

    /// Sets a sink's volume in `[0, 1]`.
    async fn set_sink_volume(&self, name: &str, volume: f64) -> CastellanResult<()>;

    /// Sets a sink's mute flag.
    async fn set_sink_mute(&self, name: &str, mute: bool) -> CastellanResult<()>;

    /// Sets a sink input's volume in `[0, 1]`.
    async fn set_sink_input_volume(
        &self,
        index: u32,
        channels: u8,
        volume: f64,
    ) -> CastellanResult<()>;

    /// Sets a sink input's mute flag.
    async fn set_sink_input_mute(&self, index: u32, mute: bool) -> CastellanResult<()>;

    /// Change notifications for the sink-input subscription mask.
    ///
    /// Each ping means "something changed, re-enumerate". May only be
    /// called once; reconnects keep feeding the same receiver.
    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<()>>;

    /// Round-trips to the server to check liveness.
    async fn ping(&self) -> CastellanResult<()>;

    /// Tears down the current session and establishes a fresh one.
    async fn reconnect(&self) -> CastellanResult<()>;
}
