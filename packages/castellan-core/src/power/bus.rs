//! Trait abstraction for session-manager power operations.

use async_trait::async_trait;

use crate::error::CastellanResult;

/// Session-manager primitives for power control.
///
/// The capability queries answer with the session manager's vocabulary
/// (`"yes"`, `"no"`, `"challenge"`, `"na"`); only `"yes"` authorises the
/// corresponding action.
#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn can_reboot(&self) -> CastellanResult<String>;
    async fn can_power_off(&self) -> CastellanResult<String>;
    async fn reboot(&self, interactive: bool) -> CastellanResult<()>;
    async fn power_off(&self, interactive: bool) -> CastellanResult<()>;
}
