//! Application bootstrap and dependency wiring.
//!
//! The composition root: the single place where bus clients and backends
//! are instantiated, started in fixed order, and wired into the event
//! pipeline (per-backend channels -> merge -> broadcaster).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::audio::{AudioBackend, PulseClient};
use crate::config::Config;
use crate::error::{CastellanError, CastellanResult};
use crate::events::{merge_events, spawn_driver, Broadcaster};
use crate::players::{MprisBus, PlayersBackend};
use crate::power::{LogindBus, PowerBackend};
use crate::units::{InitBus, SystemdBus, UnitScope, UnitsBackend};
use crate::utils;

/// Deadline for init-system and session-manager bus calls.
const BUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Container for all bootstrapped backends and the event pipeline.
///
/// Consumed by [`AppState`](crate::api::AppState) to build the final
/// application state.
pub struct Backends {
    pub players: Option<Arc<PlayersBackend>>,
    pub audio: Option<Arc<AudioBackend>>,
    pub units: Option<Arc<UnitsBackend>>,
    pub power: Option<Arc<PowerBackend>>,
    /// Fan-out stage of the event pipeline.
    pub broadcaster: Arc<Broadcaster>,
    /// Root cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl Backends {
    /// Initiates graceful shutdown: closes every backend (stopping its
    /// watchers and its event channel), then cancels the pipeline.
    pub fn shutdown(&self) {
        log::info!("[Bootstrap] beginning graceful shutdown");
        if let Some(backend) = &self.players {
            backend.close();
        }
        if let Some(backend) = &self.audio {
            backend.close();
        }
        if let Some(backend) = &self.units {
            backend.close();
        }
        if let Some(backend) = &self.power {
            backend.close();
        }
        self.cancel_token.cancel();
        log::info!("[Bootstrap] shutdown complete");
    }
}

/// Bootstraps all backends with their dependencies.
///
/// Disabled subsystems yield `None`; an enabled subsystem whose eager
/// health check fails (bus unreachable, capability refused) aborts
/// startup. Backends are started in fixed order, then their event
/// channels are merged and the broadcaster driver spawned.
pub async fn bootstrap_backends(config: &Config) -> CastellanResult<Backends> {
    utils::refuse_root().map_err(CastellanError::Upstream)?;
    config
        .validate()
        .map_err(|message| CastellanError::Validation {
            field: "config",
            message,
        })?;

    let cancel_token = CancellationToken::new();

    let players = if config.mpris.enabled {
        let bus = MprisBus::connect(&config.mpris).await?;
        PlayersBackend::new(&config.mpris, Arc::new(bus), cancel_token.child_token())
    } else {
        None
    };

    let audio = if config.pulseaudio.enabled {
        let client = PulseClient::connect(&config.pulseaudio).await?;
        AudioBackend::new(&config.pulseaudio, Arc::new(client), cancel_token.child_token())
    } else {
        None
    };

    let units = if config.systemd.enabled {
        let system: Option<Arc<dyn InitBus>> = if config.systemd.system.is_empty() {
            None
        } else {
            Some(Arc::new(SystemdBus::connect(UnitScope::System, BUS_TIMEOUT).await?))
        };
        let user: Option<Arc<dyn InitBus>> = if config.systemd.user.is_empty() {
            None
        } else {
            match SystemdBus::connect(UnitScope::User, BUS_TIMEOUT).await {
                Ok(bus) => Some(Arc::new(bus)),
                Err(e) if config.systemd.headless => {
                    // Expected on hosts without a user-session record; the
                    // filesystem watcher covers the user scope there.
                    log::warn!("[Bootstrap] user bus unavailable ({e}); using filesystem watch");
                    None
                }
                Err(e) => return Err(e),
            }
        };
        UnitsBackend::new(&config.systemd, system, user, cancel_token.child_token())
    } else {
        None
    };

    let power = if config.power.enabled {
        let manager = LogindBus::connect(BUS_TIMEOUT).await?;
        PowerBackend::new(&config.power, Arc::new(manager), cancel_token.child_token()).await?
    } else {
        None
    };

    // Start in fixed order; each backend launches its own watcher tasks.
    if let Some(backend) = &players {
        backend.start().await?;
    }
    if let Some(backend) = &audio {
        backend.start().await?;
    }
    if let Some(backend) = &units {
        backend.start().await?;
    }
    if let Some(backend) = &power {
        backend.start()?;
    }

    // Wire the pipeline: per-backend channels -> merge -> broadcaster.
    let sources = vec![
        players.as_ref().and_then(|backend| backend.events()),
        audio.as_ref().and_then(|backend| backend.events()),
        units.as_ref().and_then(|backend| backend.events()),
        power.as_ref().and_then(|backend| backend.events()),
    ];
    let merged = merge_events(sources, cancel_token.child_token());
    let broadcaster = Arc::new(Broadcaster::new());
    spawn_driver(Arc::clone(&broadcaster), merged, cancel_token.child_token());

    Ok(Backends {
        players,
        audio,
        units,
        power,
        broadcaster,
        cancel_token,
    })
}
