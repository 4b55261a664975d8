//! Platform services of the host machine
//!
//! The host is already on a network, so joining WiFi only records the
//! credentials and scanning finds nothing.

use std::net::UdpSocket;
use tracing::info;

use netmodem_core::ports::{AccessPoint, Platform, StaticIps};

#[derive(Debug, Default)]
pub struct HostPlatform {
    ssid: Option<String>,
    hostname: String,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Address of the interface holding the default route
fn route_address() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    // connect() on UDP only selects a route
    socket.connect("192.0.2.1:9").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

impl Platform for HostPlatform {
    fn wifi_connected(&self) -> bool {
        self.ssid.is_some()
    }

    fn connect_wifi(&mut self, ssid: &str, _password: &str, statics: Option<&StaticIps>) -> bool {
        if ssid.is_empty() {
            return false;
        }
        if let Some(ips) = statics {
            info!("static address {} ignored on host networking", ips.ip);
        }
        self.ssid = Some(ssid.to_string());
        true
    }

    fn disconnect_wifi(&mut self) {
        self.ssid = None;
    }

    fn scan(&mut self) -> Vec<AccessPoint> {
        Vec::new()
    }

    fn local_ip(&self) -> String {
        route_address().unwrap_or_else(|| "0.0.0.0".to_string())
    }

    fn mac_address(&self) -> String {
        "00:00:00:00:00:00".to_string()
    }

    fn free_memory(&self) -> u64 {
        0
    }

    fn describe(&self) -> String {
        format!("host={} os={}", self.hostname, std::env::consts::OS)
    }

    fn set_hostname(&mut self, hostname: &str) {
        self.hostname = hostname.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_records_ssid() {
        let mut host = HostPlatform::new();
        assert!(!host.wifi_connected());
        assert!(!host.connect_wifi("", "pw", None));
        assert!(host.connect_wifi("home", "pw", None));
        assert!(host.wifi_connected());
        host.disconnect_wifi();
        assert!(!host.wifi_connected());
    }
}
