//! Trait abstraction for init-system operations, one instance per scope.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CastellanResult;

/// Raw unit state as reported by the init system.
#[derive(Debug, Clone, Default)]
pub struct UnitStatus {
    pub name: String,
    pub description: String,
    pub active_state: String,
    pub sub_state: String,
    pub unit_file_state: String,
    /// Whether the init system knows a unit file for this name.
    pub exists: bool,
}

/// A unit state-change notification.
#[derive(Debug, Clone)]
pub struct UnitSignal {
    /// Canonical unit name (object path already decoded).
    pub unit: String,
    /// New sub-state when the payload carried one.
    pub sub_state: Option<String>,
}

/// Init-system primitives for one scope (system or user bus).
#[async_trait]
pub trait InitBus: Send + Sync {
    /// Bulk status lookup for the given unit names.
    async fn list_units(&self, names: &[String]) -> CastellanResult<Vec<UnitStatus>>;

    /// Status of one unit.
    async fn unit_status(&self, name: &str) -> CastellanResult<UnitStatus>;

    async fn start_unit(&self, name: &str) -> CastellanResult<()>;
    async fn stop_unit(&self, name: &str) -> CastellanResult<()>;
    async fn restart_unit(&self, name: &str) -> CastellanResult<()>;

    /// Enables the unit file and reloads the init system's state.
    async fn enable_unit(&self, name: &str) -> CastellanResult<()>;

    /// Disables the unit file and reloads the init system's state.
    async fn disable_unit(&self, name: &str) -> CastellanResult<()>;

    /// Subscribes to unit property-change signals for this scope.
    ///
    /// May only be called once per connection.
    async fn signals(&self) -> CastellanResult<mpsc::Receiver<UnitSignal>>;
}
