//! Media player entity types and bus signal payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Well-known bus name prefix for media players.
pub const PLAYER_BUS_PREFIX: &str = "org.mpris.MediaPlayer2";

/// Object path every media player exports.
pub const PLAYER_OBJECT_PATH: &str = "/org/mpris/MediaPlayer2";

/// Application-level interface (identity).
pub const PLAYER_APP_INTERFACE: &str = "org.mpris.MediaPlayer2";

/// Playback control interface.
pub const PLAYER_INTERFACE: &str = "org.mpris.MediaPlayer2.Player";

/// Current transport state of a player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    #[default]
    Stopped,
}

impl PlaybackStatus {
    /// Parses the bus string form; unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Playing" => Some(Self::Playing),
            "Paused" => Some(Self::Paused),
            "Stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Loop mode of a player. `None` means no looping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopStatus {
    #[default]
    None,
    Track,
    Playlist,
}

impl LoopStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "None" => Some(Self::None),
            "Track" => Some(Self::Track),
            "Playlist" => Some(Self::Playlist),
            _ => None,
        }
    }

    /// The bus string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Track => "Track",
            Self::Playlist => "Playlist",
        }
    }
}

/// The subset of operations a player currently supports, as reported by
/// the player itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub can_play: bool,
    pub can_pause: bool,
    pub can_go_next: bool,
    pub can_go_previous: bool,
    pub can_seek: bool,
    pub can_control: bool,
}

/// One media player on the session bus.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Well-known bus name; unique within the cache and never empty.
    pub bus_name: String,
    /// Human-readable identity reported by the player.
    pub identity: String,
    /// Transient unique connection id, used to correlate incoming signals
    /// whose sender is not the well-known name.
    #[serde(skip)]
    pub owner: String,
    pub playback_status: PlaybackStatus,
    pub loop_status: LoopStatus,
    pub shuffle: bool,
    /// Volume in `[0, 1]`.
    pub volume: f64,
    /// Playback position in microseconds.
    pub position: i64,
    pub rate: f64,
    /// Flat string metadata (title, artist, album, ...).
    pub metadata: BTreeMap<String, String>,
    pub capabilities: Capabilities,
}

/// Transport commands without parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Play,
    Pause,
    PlayPause,
    Stop,
    Next,
    Previous,
}

impl TransportCommand {
    /// The bus method name.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Play => "Play",
            Self::Pause => "Pause",
            Self::PlayPause => "PlayPause",
            Self::Stop => "Stop",
            Self::Next => "Next",
            Self::Previous => "Previous",
        }
    }

    /// Parses the URL action segment.
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "play" => Some(Self::Play),
            "pause" => Some(Self::Pause),
            "play_pause" => Some(Self::PlayPause),
            "stop" => Some(Self::Stop),
            "next" => Some(Self::Next),
            "previous" => Some(Self::Previous),
            _ => None,
        }
    }

    /// The capability flag gating this command.
    pub fn required_capability(&self, capabilities: &Capabilities) -> (&'static str, bool) {
        match self {
            Self::Play => ("CanPlay", capabilities.can_play),
            Self::Pause | Self::PlayPause => ("CanPause", capabilities.can_pause),
            Self::Stop => ("CanControl", capabilities.can_control),
            Self::Next => ("CanGoNext", capabilities.can_go_next),
            Self::Previous => ("CanGoPrevious", capabilities.can_go_previous),
        }
    }
}

/// A single typed property update extracted from a bus signal payload.
#[derive(Debug, Clone)]
pub enum PlayerProperty {
    PlaybackStatus(PlaybackStatus),
    LoopStatus(LoopStatus),
    Shuffle(bool),
    Volume(f64),
    Position(i64),
    Rate(f64),
    Metadata(BTreeMap<String, String>),
    Capability(&'static str, bool),
}

/// External signals the watcher consumes.
#[derive(Debug)]
pub enum PlayerSignal {
    /// A properties-changed signal; `sender` is the transient unique id.
    PropertiesChanged {
        sender: String,
        properties: Vec<PlayerProperty>,
    },
    /// A well-known name changed its owner.
    NameOwnerChanged {
        name: String,
        old_owner: String,
        new_owner: String,
    },
}
