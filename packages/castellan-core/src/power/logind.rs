//! Session-manager bus implementation of [`SessionManager`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use zbus::{Connection, Proxy};

use crate::error::{CastellanError, CastellanResult};

use super::bus::SessionManager;

const MANAGER_DESTINATION: &str = "org.freedesktop.login1";
const MANAGER_PATH: &str = "/org/freedesktop/login1";
const MANAGER_INTERFACE: &str = "org.freedesktop.login1.Manager";

/// Session-manager client on the system bus.
pub struct LogindBus {
    manager: Proxy<'static>,
    timeout: Duration,
}

impl LogindBus {
    /// Connects to the system bus and binds the session manager.
    pub async fn connect(timeout: Duration) -> CastellanResult<Self> {
        let conn = Connection::system().await?;
        let manager = Proxy::new(
            &conn,
            MANAGER_DESTINATION,
            MANAGER_PATH,
            MANAGER_INTERFACE,
        )
        .await?;
        Ok(Self { manager, timeout })
    }

    async fn with_deadline<T, E>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
    ) -> CastellanResult<T>
    where
        E: Into<CastellanError>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(CastellanError::Timeout),
        }
    }
}

#[async_trait]
impl SessionManager for LogindBus {
    async fn can_reboot(&self) -> CastellanResult<String> {
        self.with_deadline(self.manager.call::<_, _, String>("CanReboot", &()))
            .await
    }

    async fn can_power_off(&self) -> CastellanResult<String> {
        self.with_deadline(self.manager.call::<_, _, String>("CanPowerOff", &()))
            .await
    }

    async fn reboot(&self, interactive: bool) -> CastellanResult<()> {
        self.with_deadline(self.manager.call::<_, _, ()>("Reboot", &(interactive,)))
            .await
    }

    async fn power_off(&self, interactive: bool) -> CastellanResult<()> {
        self.with_deadline(self.manager.call::<_, _, ()>("PowerOff", &(interactive,)))
            .await
    }
}
