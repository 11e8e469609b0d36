//! mDNS service advertisement for network discovery.
//!
//! Best-effort: failure is logged but never prevents the daemon from
//! running.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use mdns_sd::{ServiceDaemon, ServiceInfo};

use crate::config::ZeroconfConfig;

/// Advertises the HTTP endpoint via mDNS/DNS-SD.
///
/// When created, registers the service with the local mDNS responder.
/// The service is automatically unregistered when dropped.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    service_fullname: String,
    /// Tracks whether shutdown has been called to prevent double unregister.
    shutdown_called: AtomicBool,
}

impl MdnsAdvertiser {
    /// Creates and registers an mDNS service advertisement.
    ///
    /// # Errors
    /// Returns an error if the mDNS daemon cannot be created or the
    /// service cannot be registered (e.g., mDNS not available on the
    /// system).
    pub fn new(
        config: &ZeroconfConfig,
        advertise_ip: IpAddr,
        api_port: u16,
    ) -> Result<Self, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let instance_name = if config.instance_name.is_empty() {
            format!("Castellan {hostname}")
        } else {
            config.instance_name.clone()
        };

        // Sanitize hostname for DNS (lowercase, no spaces)
        let dns_hostname = hostname
            .to_lowercase()
            .replace(' ', "-")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect::<String>();

        let mut txt: HashMap<String, String> = config.txt_records.clone().into_iter().collect();
        txt.entry("version".to_string())
            .or_insert_with(|| env!("CARGO_PKG_VERSION").to_string());
        txt.entry("path".to_string())
            .or_insert_with(|| "/server".to_string());

        let port = if config.port > 0 { config.port } else { api_port };
        let service = ServiceInfo::new(
            &config.service_type,
            &instance_name,
            &format!("{dns_hostname}.{}", config.domain),
            advertise_ip,
            port,
            Some(txt),
        )?;

        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;

        log::info!(
            "[mDNS] Advertising '{}' at {}:{}",
            instance_name,
            advertise_ip,
            port
        );

        Ok(Self {
            daemon,
            service_fullname: fullname,
            shutdown_called: AtomicBool::new(false),
        })
    }

    /// Unregisters the service from mDNS.
    ///
    /// Called automatically on drop, but can be called manually for
    /// explicit cleanup. Safe to call multiple times.
    pub fn shutdown(&self) {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.daemon.unregister(&self.service_fullname) {
            log::warn!("[mDNS] Failed to unregister service: {}", e);
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.shutdown();
    }
}
