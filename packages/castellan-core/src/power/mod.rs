//! Power backend.
//!
//! Exposes reboot and poweroff through the session manager, gated by a
//! static capability pair validated once at startup and immutable
//! thereafter.

mod bus;
pub mod logind;

pub use bus::SessionManager;
pub use logind::LogindBus;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::PowerConfig;
use crate::error::{CastellanError, CastellanResult};
use crate::events::{Event, EventType, BACKEND_CHANNEL_CAPACITY};

/// The static capability pair published by the backend.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerCapabilities {
    pub can_reboot: bool,
    pub can_poweroff: bool,
}

/// Backend for power operations.
pub struct PowerBackend {
    manager: Arc<dyn SessionManager>,
    capabilities: PowerCapabilities,
    events_tx: Mutex<Option<mpsc::Sender<Event>>>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PowerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerBackend")
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl PowerBackend {
    /// Validates configured capabilities against the session manager and
    /// creates the backend.
    ///
    /// Returns `None` when disabled, or enabled with no capability
    /// declared. Each declared capability must be answered `"yes"` by the
    /// session manager; anything else fails construction.
    pub async fn new(
        config: &PowerConfig,
        manager: Arc<dyn SessionManager>,
        cancel: CancellationToken,
    ) -> CastellanResult<Option<Arc<Self>>> {
        if !config.enabled {
            return Ok(None);
        }
        if !config.capabilities.reboot && !config.capabilities.poweroff {
            log::warn!("[Power] enabled without any declared capability; backend disabled");
            return Ok(None);
        }

        if config.capabilities.reboot {
            let answer = manager.can_reboot().await?;
            if answer != "yes" {
                log::error!("[Power] session manager answered CanReboot={answer}");
                return Err(CastellanError::Capability {
                    required: "CanReboot",
                });
            }
        }
        if config.capabilities.poweroff {
            let answer = manager.can_power_off().await?;
            if answer != "yes" {
                log::error!("[Power] session manager answered CanPowerOff={answer}");
                return Err(CastellanError::Capability {
                    required: "CanPowerOff",
                });
            }
        }

        let capabilities = PowerCapabilities {
            can_reboot: config.capabilities.reboot,
            can_poweroff: config.capabilities.poweroff,
        };
        log::info!(
            "[Power] ready (reboot={}, poweroff={})",
            capabilities.can_reboot,
            capabilities.can_poweroff
        );
        let (tx, rx) = mpsc::channel(BACKEND_CHANNEL_CAPACITY);
        Ok(Some(Arc::new(Self {
            manager,
            capabilities,
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            cancel,
        })))
    }

    /// No long-lived tasks; present for contract symmetry with the other
    /// backends.
    pub fn start(&self) -> CastellanResult<()> {
        Ok(())
    }

    /// Closes the outbound event channel. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        self.events_tx.lock().take();
    }

    /// Hands out the outbound event channel. Yields `Some` exactly once.
    pub fn events(&self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx.lock().take()
    }

    /// The capability pair established at startup.
    pub fn capabilities(&self) -> PowerCapabilities {
        self.capabilities
    }

    /// Reboots the host.
    ///
    /// The published flag is checked before touching the bus; the
    /// `power.action` event goes out after the request so subscribers can
    /// react before the host dies.
    pub async fn reboot(&self) -> CastellanResult<()> {
        if !self.capabilities.can_reboot {
            return Err(CastellanError::NotAllowed { action: "reboot" });
        }
        self.manager.reboot(true).await?;
        self.emit_action("reboot").await;
        Ok(())
    }

    /// Powers off the host.
    pub async fn power_off(&self) -> CastellanResult<()> {
        if !self.capabilities.can_poweroff {
            return Err(CastellanError::NotAllowed { action: "poweroff" });
        }
        self.manager.power_off(true).await?;
        self.emit_action("poweroff").await;
        Ok(())
    }

    async fn emit_action(&self, action: &str) {
        let sender = self.events_tx.lock().clone();
        if let Some(tx) = sender {
            let event = Event::new(EventType::PowerAction, json!({ "action": action }));
            if tx.send(event).await.is_err() {
                log::debug!("[Power] event channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PowerCapabilitiesConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    struct ScriptedManager {
        reboot_answer: &'static str,
        poweroff_answer: &'static str,
        calls: SyncMutex<Vec<String>>,
    }

    impl ScriptedManager {
        fn new(reboot_answer: &'static str, poweroff_answer: &'static str) -> Arc<Self> {
            Arc::new(Self {
                reboot_answer,
                poweroff_answer,
                calls: SyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SessionManager for ScriptedManager {
        async fn can_reboot(&self) -> CastellanResult<String> {
            Ok(self.reboot_answer.to_string())
        }

        async fn can_power_off(&self) -> CastellanResult<String> {
            Ok(self.poweroff_answer.to_string())
        }

        async fn reboot(&self, interactive: bool) -> CastellanResult<()> {
            self.calls.lock().push(format!("reboot {interactive}"));
            Ok(())
        }

        async fn power_off(&self, interactive: bool) -> CastellanResult<()> {
            self.calls.lock().push(format!("poweroff {interactive}"));
            Ok(())
        }
    }

    fn config(reboot: bool, poweroff: bool) -> PowerConfig {
        PowerConfig {
            enabled: true,
            capabilities: PowerCapabilitiesConfig { reboot, poweroff },
        }
    }

    #[tokio::test]
    async fn disabled_or_empty_config_yields_no_backend() {
        let manager = ScriptedManager::new("yes", "yes");
        let disabled = PowerConfig::default();
        assert!(PowerBackend::new(&disabled, manager.clone(), CancellationToken::new())
            .await
            .unwrap()
            .is_none());

        let empty = config(false, false);
        assert!(PowerBackend::new(&empty, manager, CancellationToken::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn construction_requires_yes_for_declared_capabilities() {
        let manager = ScriptedManager::new("challenge", "yes");
        let err = PowerBackend::new(&config(true, false), manager, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CastellanError::Capability { required: "CanReboot" }
        ));
    }

    #[tokio::test]
    async fn undeclared_capability_is_refused_without_touching_the_bus() {
        // Session manager would allow reboot but not poweroff; operator
        // only declared reboot.
        let manager = ScriptedManager::new("yes", "no");
        let backend =
            PowerBackend::new(&config(true, false), manager.clone(), CancellationToken::new())
                .await
                .unwrap()
                .unwrap();

        let capabilities = backend.capabilities();
        assert!(capabilities.can_reboot);
        assert!(!capabilities.can_poweroff);

        let err = backend.power_off().await.unwrap_err();
        assert_eq!(err.to_string(), "action not allowed");
        assert!(manager.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn reboot_requests_interactively_and_emits_power_action() {
        let manager = ScriptedManager::new("yes", "yes");
        let backend = PowerBackend::new(
            &config(true, true),
            manager.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .unwrap();
        let mut events = backend.events().unwrap();

        backend.reboot().await.unwrap();
        assert_eq!(manager.calls.lock().clone(), vec!["reboot true"]);

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::PowerAction);
        assert_eq!(event.data["action"], "reboot");
    }
}
