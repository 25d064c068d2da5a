//! Node identity for LabWatch edge agents
//!
//! - Primary MAC address detection with priority (Ethernet > WiFi > Other)
//! - Node ID derived from that MAC (colons stripped), so it survives reboots
//! - Falls back to the local IP when no interface exposes a MAC

use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: String,
    pub ip: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub hostname: String,
    pub os: String,
    pub architecture: String,
    pub primary_mac: Option<String>,
}

impl NodeIdentity {
    pub fn discover(override_id: Option<&str>) -> Result<Self> {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let interfaces = enumerate_interfaces().context("Failed to enumerate network interfaces")?;
        let primary = select_primary(&interfaces);

        let node_id = match (override_id, primary) {
            (Some(id), _) => id.to_string(),
            (None, Some(iface)) => node_id_from_mac(&iface.mac),
            (None, None) => {
                let ip = first_non_loopback_ip().unwrap_or_else(|| "127.0.0.1".to_string());
                warn!("No MAC address available, using {ip} as node id");
                ip
            }
        };
        info!("Identity: node {node_id} on {hostname}");

        Ok(Self {
            node_id,
            hostname,
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            primary_mac: primary.map(|i| i.mac.clone()),
        })
    }
}

pub fn node_id_from_mac(mac: &str) -> String {
    mac.replace(':', "").to_lowercase()
}

fn enumerate_interfaces() -> Result<Vec<NetworkInterface>> {
    let mut interfaces = Vec::new();
    for if_addr in get_if_addrs()? {
        if if_addr.is_loopback() {
            continue;
        }
        let ip = match if_addr.addr {
            IfAddr::V4(v4) => v4.ip.to_string(),
            IfAddr::V6(v6) => v6.ip.to_string(),
        };
        let mac = match mac_address::mac_address_by_name(&if_addr.name) {
            Ok(Some(mac)) => mac.to_string().to_lowercase(),
            Ok(None) => continue,
            Err(e) => {
                debug!("Error getting MAC for {}: {}", if_addr.name, e);
                continue;
            }
        };
        debug!("Found interface: {} ({})", if_addr.name, mac);
        interfaces.push(NetworkInterface {
            interface_type: classify_interface(&if_addr.name),
            name: if_addr.name,
            mac,
            ip,
        });
    }
    Ok(interfaces)
}

fn first_non_loopback_ip() -> Option<String> {
    get_if_addrs()
        .ok()?
        .into_iter()
        .find(|i| !i.is_loopback())
        .map(|i| i.ip().to_string())
}

fn classify_interface(name: &str) -> InterfaceType {
    let name = name.to_lowercase();
    if name == "lo" || name.starts_with("lo0") {
        return InterfaceType::Loopback;
    }
    if ["wlan", "wifi", "wlp", "wlo"].iter().any(|p| name.contains(p)) {
        return InterfaceType::Wireless;
    }
    if ["eth", "en"].iter().any(|p| name.starts_with(p)) {
        return InterfaceType::Ethernet;
    }
    InterfaceType::Other
}

/// Ethernet, puis WiFi, puis la première interface restante
fn select_primary(interfaces: &[NetworkInterface]) -> Option<&NetworkInterface> {
    interfaces
        .iter()
        .find(|i| i.interface_type == InterfaceType::Ethernet)
        .or_else(|| interfaces.iter().find(|i| i.interface_type == InterfaceType::Wireless))
        .or_else(|| interfaces.iter().find(|i| i.interface_type != InterfaceType::Loopback))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, mac: &str) -> NetworkInterface {
        NetworkInterface {
            name: name.into(),
            mac: mac.into(),
            ip: "10.0.0.2".into(),
            interface_type: classify_interface(name),
        }
    }

    #[test]
    fn test_interface_classification() {
        assert_eq!(classify_interface("eth0"), InterfaceType::Ethernet);
        assert_eq!(classify_interface("enp3s0"), InterfaceType::Ethernet);
        assert_eq!(classify_interface("wlan0"), InterfaceType::Wireless);
        assert_eq!(classify_interface("lo"), InterfaceType::Loopback);
        assert_eq!(classify_interface("docker0"), InterfaceType::Other);
    }

    #[test]
    fn test_primary_prefers_ethernet() {
        let list = vec![iface("docker0", "02:42:00:00:00:01"), iface("wlan0", "b8:27:eb:00:00:02"), iface("eth0", "b8:27:eb:00:00:01")];
        assert_eq!(select_primary(&list).unwrap().name, "eth0");
        let list = vec![iface("docker0", "02:42:00:00:00:01"), iface("wlan0", "b8:27:eb:00:00:02")];
        assert_eq!(select_primary(&list).unwrap().name, "wlan0");
        assert!(select_primary(&[]).is_none());
    }

    #[test]
    fn test_node_id_generation() {
        assert_eq!(node_id_from_mac("B8:27:EB:A1:B2:C3"), "b827eba1b2c3");
    }
}
