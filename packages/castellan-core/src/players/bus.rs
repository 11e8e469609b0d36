//! Trait abstraction for session-bus player operations.
//!
//! The backend depends on this trait rather than a concrete bus client,
//! enabling testing with recording mocks and keeping the wire dialect out
//! of the watcher logic.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CastellanResult;

use super::types::{LoopStatus, Player, PlayerSignal, TransportCommand};

/// Session-bus primitives for media player control.
///
/// Implementations carry a per-call deadline; a call past its deadline
/// surfaces as [`CastellanError::Timeout`](crate::error::CastellanError::Timeout).
#[async_trait]
pub trait PlayerBus: Send + Sync {
    /// Lists every well-known name on the bus matching the player prefix.
    async fn list_player_names(&self) -> CastellanResult<Vec<String>>;

    /// Resolves a well-known name to its transient unique connection id.
    async fn name_owner(&self, bus_name: &str) -> CastellanResult<String>;

    /// Fetches the full player record with one bulk properties read per
    /// interface.
    async fn load_player(&self, bus_name: &str) -> CastellanResult<Player>;

    /// Reads the current playback position in microseconds.
    async fn position(&self, bus_name: &str) -> CastellanResult<i64>;

    /// Invokes a parameterless transport method.
    async fn transport(&self, bus_name: &str, command: TransportCommand) -> CastellanResult<()>;

    /// Seeks by a relative offset in microseconds.
    async fn seek(&self, bus_name: &str, offset_us: i64) -> CastellanResult<()>;

    /// Jumps to an absolute position within a track.
    async fn set_position(
        &self,
        bus_name: &str,
        track_id: &str,
        position_us: i64,
    ) -> CastellanResult<()>;

    /// Sets the player volume in `[0, 1]`.
    async fn set_volume(&self, bus_name: &str, volume: f64) -> CastellanResult<()>;

    /// Sets the loop mode.
    async fn set_loop_status(&self, bus_name: &str, status: LoopStatus) -> CastellanResult<()>;

    /// Sets the shuffle flag.
    async fn set_shuffle(&self, bus_name: &str, shuffle: bool) -> CastellanResult<()>;

    /// Subscribes to the change signals the watcher consumes.
    ///
    /// The stream carries properties-changed payloads (already typed,
    /// filtered to the player interface) and name-owner changes filtered to
    /// the player prefix. May only be called once per connection.
    async fn signals(&self) -> CastellanResult<mpsc::Receiver<PlayerSignal>>;
}
