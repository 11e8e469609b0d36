//! Daemon configuration types.
//!
//! All fields have defaults; the server binary overlays a YAML file and
//! environment/CLI overrides on top of [`Config::default`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
    pub ui: UiConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8089,
            ui: UiConfig::default(),
        }
    }
}

/// Static UI asset serving (handled outside the core).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UiConfig {
    pub enabled: bool,
}

/// Cross-origin settings for the HTTP API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CorsConfig {
    /// Allowed origins; empty disables the CORS layer entirely.
    pub origins: Vec<String>,
}

/// DNS-SD advertisement of the HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ZeroconfConfig {
    pub enabled: bool,
    pub instance_name: String,
    pub service_type: String,
    pub domain: String,
    /// Advertised port; 0 means "use the API port".
    pub port: u16,
    pub txt_records: BTreeMap<String, String>,
    /// Interface to advertise on; `None` advertises on the default.
    pub listen: Option<String>,
}

impl Default for ZeroconfConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instance_name: "Castellan".to_string(),
            service_type: "_castellan._tcp.local.".to_string(),
            domain: "local.".to_string(),
            port: 0,
            txt_records: BTreeMap::new(),
            listen: None,
        }
    }
}

/// Media-player control over the session bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MprisConfig {
    pub enabled: bool,
    /// Per-call deadline in seconds for outbound bus calls.
    pub timeout: u64,
}

impl Default for MprisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: 5,
        }
    }
}

/// Audio-server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PulseaudioConfig {
    pub enabled: bool,
    /// Overrides `$XDG_RUNTIME_DIR` when locating the native socket.
    pub xdg_runtime_dir: Option<String>,
}

impl Default for PulseaudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            xdg_runtime_dir: None,
        }
    }
}

/// Unit lifecycle management.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SystemdConfig {
    pub enabled: bool,
    /// Managed system-scope units (read-only through the API).
    pub system: Vec<String>,
    /// Managed user-scope units (mutable through the API).
    pub user: Vec<String>,
    /// Hosts without user-session records: watch the runtime directory
    /// instead of the user bus signal stream.
    pub headless: bool,
}

impl Default for SystemdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            system: Vec::new(),
            user: Vec::new(),
            headless: false,
        }
    }
}

/// Power operations via the session manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PowerConfig {
    pub enabled: bool,
    pub capabilities: PowerCapabilitiesConfig,
}

/// Which power capabilities the operator wants exposed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PowerCapabilitiesConfig {
    pub reboot: bool,
    pub poweroff: bool,
}

/// Bluetooth settings. Recognised for forward compatibility; no backend
/// consumes them yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BluetoothConfig {
    pub enabled: bool,
    pub timeout: u64,
    pub pairing_timeout: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: 10,
            pairing_timeout: 60,
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Interface name to bind to, or `all` for every interface.
    pub bind: String,
    pub log_level: String,
    pub api: ApiConfig,
    pub cors: CorsConfig,
    pub zeroconf: ZeroconfConfig,
    pub mpris: MprisConfig,
    pub pulseaudio: PulseaudioConfig,
    pub systemd: SystemdConfig,
    pub power: PowerConfig,
    pub bluetooth: BluetoothConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "lo".to_string(),
            log_level: "info".to_string(),
            api: ApiConfig::default(),
            cors: CorsConfig::default(),
            zeroconf: ZeroconfConfig::default(),
            mpris: MprisConfig::default(),
            pulseaudio: PulseaudioConfig::default(),
            systemd: SystemdConfig::default(),
            power: PowerConfig::default(),
            bluetooth: BluetoothConfig::default(),
        }
    }
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.bind.is_empty() {
            return Err("bind must be an interface name or 'all'".to_string());
        }
        if self.api.enabled && self.api.port == 0 {
            return Err("api.port must be non-zero".to_string());
        }
        if self.mpris.timeout == 0 || self.mpris.timeout > 30 {
            return Err("mpris.timeout must be between 1 and 30 seconds".to_string());
        }
        if let Some(unit) = self
            .systemd
            .system
            .iter()
            .find(|unit| self.systemd.user.contains(unit))
        {
            return Err(format!(
                "systemd.system and systemd.user must be disjoint; {unit} appears in both"
            ));
        }
        if self.power.enabled
            && !self.power.capabilities.reboot
            && !self.power.capabilities.poweroff
        {
            // Enabled with nothing declared silently disables the backend;
            // flag it so the operator notices the configuration bug.
            log::warn!("power.enabled is set but no capability is declared");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_overlapping_unit_whitelists() {
        let mut config = Config::default();
        config.systemd.system = vec!["shared.service".to_string()];
        config.systemd.user = vec!["shared.service".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_mpris_timeout() {
        let mut config = Config::default();
        config.mpris.timeout = 0;
        assert!(config.validate().is_err());
        config.mpris.timeout = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn recognises_camel_case_keys() {
        let yaml_like = serde_json::json!({
            "bind": "all",
            "logLevel": "debug",
            "systemd": {"enabled": true, "system": ["sshd.service"], "user": [], "headless": true},
            "pulseaudio": {"enabled": false, "xdgRuntimeDir": "/run/user/1000"},
            "power": {"enabled": true, "capabilities": {"reboot": true, "poweroff": false}},
        });
        let config: Config = serde_json::from_value(yaml_like).unwrap();
        assert_eq!(config.bind, "all");
        assert_eq!(config.log_level, "debug");
        assert!(config.systemd.headless);
        assert_eq!(
            config.pulseaudio.xdg_runtime_dir.as_deref(),
            Some("/run/user/1000")
        );
        assert!(config.power.capabilities.reboot);
        assert!(!config.power.capabilities.poweroff);
    }
}
