//! Audio entity types and raw introspection rows.

use std::collections::BTreeMap;

use serde::Serialize;

/// Which audio server implementation answered the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Pulseaudio,
    Pipewire,
}

/// Metadata about the connected audio server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioServerInfo {
    pub kind: ServerKind,
    pub server_name: String,
    pub server_version: String,
    /// Sink the master-level operations act on.
    pub default_sink: String,
}

/// One playback stream mixed into an output device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioClient {
    /// Server-side stream id.
    pub id: u32,
    /// The stream's `media.name`; the key per-client operations resolve by.
    pub name: String,
    /// Owning application name.
    pub host: String,
    /// Owning process binary.
    pub binary: String,
    pub muted: bool,
    /// Volume in `[0, 1]`.
    pub volume: f64,
    /// Stream suspended by the server.
    pub corked: bool,
    pub server: ServerKind,
    pub properties: BTreeMap<String, String>,
    /// Channel count, needed to write the volume back.
    #[serde(skip)]
    pub channels: u8,
}

/// Raw sink-input row from the audio server.
#[derive(Debug, Clone, Default)]
pub struct SinkInput {
    pub index: u32,
    pub name: String,
    pub owner_module: Option<u32>,
    pub volume: f64,
    pub muted: bool,
    pub corked: bool,
    pub channels: u8,
    pub properties: BTreeMap<String, String>,
}

/// Raw module row.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub index: u32,
    pub name: String,
    pub argument: String,
}

/// Raw source row.
#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    pub index: u32,
    pub name: String,
    pub description: String,
}

/// Mute/volume state of a sink.
#[derive(Debug, Clone, Default)]
pub struct SinkState {
    pub name: String,
    pub volume: f64,
    pub muted: bool,
}
