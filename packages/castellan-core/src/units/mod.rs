//! Units backend.
//!
//! Manages a whitelisted set of init-system units across the system and
//! user scopes. Reads enumerate whitelisted units only; every mutating
//! operation routes through a single permission gate before any outbound
//! call.

mod bus;
pub mod systemd;
mod watcher;

pub use bus::{InitBus, UnitSignal, UnitStatus};
pub use systemd::SystemdBus;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::config::SystemdConfig;
use crate::error::{CastellanError, CastellanResult};
use crate::events::{Event, EventType, BACKEND_CHANNEL_CAPACITY};
use crate::utils;

const SERVICES_KEY: &str = "services";

/// Which init-system bus a unit lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitScope {
    System,
    User,
}

impl UnitScope {
    /// Parses the URL path segment.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for UnitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::User => f.write_str("user"),
        }
    }
}

/// One managed unit, as served by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub scope: UnitScope,
    pub active_state: String,
    pub sub_state: String,
    pub running: bool,
    pub enabled: bool,
    pub exists: bool,
    pub description: String,
}

impl Service {
    fn from_status(scope: UnitScope, status: UnitStatus) -> Self {
        let running = status.active_state == "active" && status.sub_state == "running";
        let enabled = status.unit_file_state == "enabled";
        Self {
            name: status.name,
            scope,
            active_state: status.active_state,
            sub_state: status.sub_state,
            running,
            enabled,
            exists: status.exists,
            description: status.description,
        }
    }
}

/// Backend for unit lifecycle management.
pub struct UnitsBackend {
    system: Option<Arc<dyn InitBus>>,
    user: Option<Arc<dyn InitBus>>,
    system_whitelist: Vec<String>,
    user_whitelist: Vec<String>,
    headless: bool,
    cache: TtlCache<&'static str, Vec<Service>>,
    /// Last observed sub-state per unit, for signal dedup.
    last_sub_state: DashMap<(UnitScope, String), String>,
    events_tx: Mutex<Option<mpsc::Sender<Event>>>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    cancel: CancellationToken,
}

impl UnitsBackend {
    /// Creates the backend, or `None` when disabled or when no whitelist
    /// entry exists in either scope.
    pub fn new(
        config: &SystemdConfig,
        system: Option<Arc<dyn InitBus>>,
        user: Option<Arc<dyn InitBus>>,
        cancel: CancellationToken,
    ) -> Option<Arc<Self>> {
        if !config.enabled {
            return None;
        }
        if config.system.is_empty() && config.user.is_empty() {
            return None;
        }
        let (tx, rx) = mpsc::channel(BACKEND_CHANNEL_CAPACITY);
        Some(Arc::new(Self {
            system,
            user,
            system_whitelist: config.system.clone(),
            user_whitelist: config.user.clone(),
            headless: config.headless,
            cache: TtlCache::new(Duration::ZERO),
            last_sub_state: DashMap::new(),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            cancel,
        }))
    }

    /// Enumerates whitelisted units and starts the per-scope watchers.
    pub async fn start(self: &Arc<Self>) -> CastellanResult<()> {
        let services = self.enumerate().await?;
        for service in &services {
            self.last_sub_state.insert(
                (service.scope, service.name.clone()),
                service.sub_state.clone(),
            );
        }
        log::info!("[Units] managing {} unit(s)", services.len());
        self.cache.set(SERVICES_KEY, services);

        if let Some(bus) = &self.system {
            if !self.system_whitelist.is_empty() {
                let signals = bus.signals().await?;
                watcher::spawn_bus_watcher(Arc::clone(self), UnitScope::System, signals);
            }
        }
        if !self.user_whitelist.is_empty() {
            if self.headless {
                let dir = format!("{}/systemd/units", utils::runtime_dir(None));
                watcher::spawn_headless_watcher(Arc::clone(self), dir.into()).map_err(|e| {
                    CastellanError::Upstream(format!("failed to watch user units: {e}"))
                })?;
            } else if let Some(bus) = &self.user {
                let signals = bus.signals().await?;
                watcher::spawn_bus_watcher(Arc::clone(self), UnitScope::User, signals);
            }
        }
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

    /// Current enumeration of managed units.
    pub fn list(&self) -> Vec<Service> {
        self.cache.get(&SERVICES_KEY).unwrap_or_default()
    }

    /// Timestamp of the last cache write, for `Last-Modified`.
    pub fn updated_at(&self) -> SystemTime {
        self.cache.updated_at()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────

    pub async fn start_service(&self, name: &str, scope: UnitScope) -> CastellanResult<()> {
        self.can_execute(name, scope)?;
        self.bus(scope)?.start_unit(name).await
    }

    pub async fn stop_service(&self, name: &str, scope: UnitScope) -> CastellanResult<()> {
        self.can_execute(name, scope)?;
        self.bus(scope)?.stop_unit(name).await
    }

    pub async fn restart_service(&self, name: &str, scope: UnitScope) -> CastellanResult<()> {
        self.can_execute(name, scope)?;
        self.bus(scope)?.restart_unit(name).await
    }

    pub async fn enable_service(&self, name: &str, scope: UnitScope) -> CastellanResult<()> {
        self.can_execute(name, scope)?;
        self.bus(scope)?.enable_unit(name).await
    }

    pub async fn disable_service(&self, name: &str, scope: UnitScope) -> CastellanResult<()> {
        self.can_execute(name, scope)?;
        self.bus(scope)?.disable_unit(name).await
    }

    /// The single permission gate for mutating operations.
    ///
    /// System-scope mutations are always refused; user-scope mutations
    /// require the unit to be in the managed user whitelist.
    fn can_execute(&self, name: &str, scope: UnitScope) -> CastellanResult<()> {
        match scope {
            UnitScope::System => Err(CastellanError::PermissionSystem {
                unit: name.to_string(),
            }),
            UnitScope::User => {
                if self.user_whitelist.iter().any(|unit| unit == name) {
                    Ok(())
                } else {
                    Err(CastellanError::PermissionUser {
                        unit: name.to_string(),
                    })
                }
            }
        }
    }

    fn bus(&self, scope: UnitScope) -> CastellanResult<&Arc<dyn InitBus>> {
        let bus = match scope {
            UnitScope::System => self.system.as_ref(),
            UnitScope::User => self.user.as_ref(),
        };
        bus.ok_or(CastellanError::Disabled {
            subsystem: "systemd",
        })
    }

    fn is_managed(&self, name: &str, scope: UnitScope) -> bool {
        let whitelist = match scope {
            UnitScope::System => &self.system_whitelist,
            UnitScope::User => &self.user_whitelist,
        };
        whitelist.iter().any(|unit| unit == name)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Enumeration & change application
    // ─────────────────────────────────────────────────────────────────────

    async fn enumerate(&self) -> CastellanResult<Vec<Service>> {
        let mut services = Vec::new();
        for (scope, whitelist) in [
            (UnitScope::System, &self.system_whitelist),
            (UnitScope::User, &self.user_whitelist),
        ] {
            if whitelist.is_empty() {
                continue;
            }
            let Ok(bus) = self.bus(scope) else {
                // Headless hosts may have no usable user bus; seed
                // placeholders so the whitelist stays visible and the
                // filesystem watcher has entries to update.
                services.extend(whitelist.iter().map(|name| Service {
                    name: name.clone(),
                    scope,
                    active_state: "unknown".to_string(),
                    sub_state: "unknown".to_string(),
                    running: false,
                    enabled: false,
                    exists: false,
                    description: String::new(),
                }));
                continue;
            };
            let statuses = bus.list_units(whitelist).await?;
            services.extend(
                statuses
                    .into_iter()
                    .map(|status| Service::from_status(scope, status)),
            );
        }
        Ok(services)
    }

    /// Applies one state-change notification.
    ///
    /// Ignores units outside the scope's whitelist and payloads without a
    /// sub-state; deduplicates against the last observed sub-state; on a
    /// real change, reloads the unit and emits `service.updated`.
    pub(crate) async fn apply_unit_change(
        &self,
        scope: UnitScope,
        name: &str,
        sub_state: Option<String>,
    ) {
        if !self.is_managed(name, scope) {
            return;
        }
        let Some(sub_state) = sub_state else { return };

        let key = (scope, name.to_string());
        let previous = self.last_sub_state.insert(key, sub_state.clone());
        if previous.as_deref() == Some(sub_state.as_str()) {
            return;
        }

        let reloaded = match self.bus(scope) {
            Ok(bus) => bus.unit_status(name).await,
            Err(e) => Err(e),
        };
        let service = match reloaded {
            Ok(status) => Service::from_status(scope, status),
            Err(e) => {
                // The headless session bus may refuse property reads;
                // project the observed sub-state onto the cached entry.
                log::debug!("[Units] reload of {name} failed ({e}), projecting sub-state");
                let Some(mut service) = self
                    .list()
                    .into_iter()
                    .find(|s| s.scope == scope && s.name == name)
                else {
                    return;
                };
                service.sub_state = sub_state.clone();
                service.running = sub_state == "running";
                service.active_state =
                    (if service.running { "active" } else { "inactive" }).to_string();
                service
            }
        };
        self.last_sub_state
            .insert((scope, name.to_string()), service.sub_state.clone());
        self.upsert_service(service.clone());
        self.emit(Event::new(EventType::ServiceUpdated, json!(service)))
            .await;
    }

    /// Inserts or replaces a unit, keeping `(scope, name)` unique.
    fn upsert_service(&self, service: Service) {
        let mut services = self.list();
        services.retain(|s| !(s.scope == service.scope && s.name == service.name));
        services.push(service);
        self.cache.set(SERVICES_KEY, services);
    }

    pub(crate) async fn emit(&self, event: Event) {
        let sender = self.events_tx.lock().clone();
        if let Some(tx) = sender {
            if tx.send(event).await.is_err() {
                log::debug!("[Units] event channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct ScriptedInitBus {
        statuses: SyncMutex<Vec<UnitStatus>>,
        calls: SyncMutex<Vec<String>>,
    }

    impl ScriptedInitBus {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }
    }

    #[async_trait]
    impl InitBus for ScriptedInitBus {
        async fn list_units(&self, names: &[String]) -> CastellanResult<Vec<UnitStatus>> {
            Ok(self
                .statuses
                .lock()
                .iter()
                .filter(|status| names.contains(&status.name))
                .cloned()
                .collect())
        }

        async fn unit_status(&self, name: &str) -> CastellanResult<UnitStatus> {
            self.statuses
                .lock()
                .iter()
                .find(|status| status.name == name)
                .cloned()
                .ok_or_else(|| CastellanError::Upstream(format!("no status for {name}")))
        }

        async fn start_unit(&self, name: &str) -> CastellanResult<()> {
            self.record(format!("start {name}"));
            Ok(())
        }

        async fn stop_unit(&self, name: &str) -> CastellanResult<()> {
            self.record(format!("stop {name}"));
            Ok(())
        }

        async fn restart_unit(&self, name: &str) -> CastellanResult<()> {
            self.record(format!("restart {name}"));
            Ok(())
        }

        async fn enable_unit(&self, name: &str) -> CastellanResult<()> {
            self.record(format!("enable {name}"));
            Ok(())
        }

        async fn disable_unit(&self, name: &str) -> CastellanResult<()> {
            self.record(format!("disable {name}"));
            Ok(())
        }

        async fn signals(&self) -> CastellanResult<mpsc::Receiver<UnitSignal>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    fn running_status(name: &str) -> UnitStatus {
        UnitStatus {
            name: name.to_string(),
            description: "A test unit".to_string(),
            active_state: "active".to_string(),
            sub_state: "running".to_string(),
            unit_file_state: "enabled".to_string(),
            exists: true,
        }
    }

    fn backend(
        system: Vec<&str>,
        user: Vec<&str>,
        user_bus: Arc<ScriptedInitBus>,
    ) -> Arc<UnitsBackend> {
        let config = SystemdConfig {
            enabled: true,
            system: system.into_iter().map(str::to_string).collect(),
            user: user.into_iter().map(str::to_string).collect(),
            headless: false,
        };
        UnitsBackend::new(
            &config,
            Some(Arc::new(ScriptedInitBus::default()) as Arc<dyn InitBus>),
            Some(user_bus as Arc<dyn InitBus>),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn backend_requires_a_whitelist() {
        let config = SystemdConfig {
            enabled: true,
            system: vec![],
            user: vec![],
            headless: false,
        };
        assert!(UnitsBackend::new(&config, None, None, CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn system_scope_mutations_are_always_refused() {
        let user_bus = Arc::new(ScriptedInitBus::default());
        let backend = backend(vec!["sshd.service"], vec![], Arc::clone(&user_bus));

        let err = backend
            .start_service("sshd.service", UnitScope::System)
            .await
            .unwrap_err();
        assert!(matches!(err, CastellanError::PermissionSystem { .. }));
        assert!(user_bus.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn unmanaged_user_units_are_refused() {
        let user_bus = Arc::new(ScriptedInitBus::default());
        let backend = backend(
            vec![],
            vec!["allowed.service"],
            Arc::clone(&user_bus),
        );

        let err = backend
            .start_service("unmanaged.service", UnitScope::User)
            .await
            .unwrap_err();
        assert!(matches!(err, CastellanError::PermissionUser { .. }));
        assert!(user_bus.calls.lock().is_empty());

        backend
            .start_service("allowed.service", UnitScope::User)
            .await
            .unwrap();
        assert_eq!(user_bus.calls.lock().clone(), vec!["start allowed.service"]);
    }

    #[tokio::test]
    async fn enumeration_derives_running_and_enabled() {
        let user_bus = Arc::new(ScriptedInitBus::default());
        *user_bus.statuses.lock() = vec![
            running_status("spotifyd.service"),
            UnitStatus {
                name: "backup.service".to_string(),
                description: "Backups".to_string(),
                active_state: "inactive".to_string(),
                sub_state: "dead".to_string(),
                unit_file_state: "disabled".to_string(),
                exists: true,
            },
        ];
        let backend = backend(
            vec![],
            vec!["spotifyd.service", "backup.service"],
            user_bus,
        );
        backend.start().await.unwrap();

        let services = backend.list();
        assert_eq!(services.len(), 2);
        let spotifyd = services
            .iter()
            .find(|s| s.name == "spotifyd.service")
            .unwrap();
        assert!(spotifyd.running);
        assert!(spotifyd.enabled);
        let backup = services.iter().find(|s| s.name == "backup.service").unwrap();
        assert!(!backup.running);
        assert!(!backup.enabled);
    }

    #[tokio::test]
    async fn state_changes_deduplicate_and_emit() {
        let user_bus = Arc::new(ScriptedInitBus::default());
        *user_bus.statuses.lock() = vec![running_status("spotifyd.service")];
        let backend = backend(vec![], vec!["spotifyd.service"], Arc::clone(&user_bus));
        backend.start().await.unwrap();
        let mut events = backend.events().unwrap();

        // Same sub-state as enumerated: deduplicated, no event.
        backend
            .apply_unit_change(
                UnitScope::User,
                "spotifyd.service",
                Some("running".to_string()),
            )
            .await;
        assert!(events.try_recv().is_err());

        // Transition: reload and emit.
        user_bus.statuses.lock()[0].sub_state = "dead".to_string();
        user_bus.statuses.lock()[0].active_state = "inactive".to_string();
        backend
            .apply_unit_change(
                UnitScope::User,
                "spotifyd.service",
                Some("dead".to_string()),
            )
            .await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::ServiceUpdated);
        assert_eq!(event.data["subState"], "dead");

        // Unmanaged unit: ignored entirely.
        backend
            .apply_unit_change(UnitScope::User, "other.service", Some("running".to_string()))
            .await;
        assert!(events.try_recv().is_err());
    }
}
