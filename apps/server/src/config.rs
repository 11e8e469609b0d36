//! Server configuration loading.
//!
//! Supports loading the daemon configuration from a YAML file with
//! environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use castellan_core::Config;

/// Loads configuration from a YAML file, then applies environment
/// overrides.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Applies environment variable overrides to the configuration.
///
/// `CASTELLAN_BIND`, `CASTELLAN_PORT`, and `CASTELLAN_LOG_LEVEL` are
/// handled by clap via `#[arg(env = ...)]` in main.rs.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("CASTELLAN_HEADLESS") {
        if let Ok(headless) = val.parse() {
            config.systemd.headless = headless;
        }
    }

    if let Ok(val) = std::env::var("CASTELLAN_PULSE_RUNTIME_DIR") {
        config.pulseaudio.xdg_runtime_dir = Some(val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_keys_map_onto_the_config() {
        let yaml = r#"
bind: all
logLevel: debug
api:
  port: 9000
systemd:
  system:
    - sshd.service
  user:
    - spotifyd.service
  headless: true
power:
  enabled: true
  capabilities:
    reboot: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind, "all");
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.systemd.system, vec!["sshd.service"]);
        assert_eq!(config.systemd.user, vec!["spotifyd.service"]);
        assert!(config.systemd.headless);
        assert!(config.power.capabilities.reboot);
        assert!(!config.power.capabilities.poweroff);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load(None).unwrap();
        assert!(config.api.enabled);
        assert!(config.validate().is_ok());
    }
}
