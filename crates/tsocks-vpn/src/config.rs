//! Tunnel Configuration
//!
//! Interface-level settings (addresses, DNS, MTU) derived from the persisted
//! settings at every start attempt.

use crate::route::{AddressFamily, Families};
use crate::settings::{RouteMode, Settings};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

/// IPv4 address of the tunnel interface
pub const TUN_ADDRESS_V4: Ipv4Addr = Ipv4Addr::new(10, 0, 8, 1);
pub const TUN_PREFIX_V4: u8 = 24;

/// IPv6 address of the tunnel interface
pub const TUN_ADDRESS_V6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0x8, 0x1);
pub const TUN_PREFIX_V6: u8 = 120;

/// Address assigned to the tunnel interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TunnelAddress {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl TunnelAddress {
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.address)
    }
}

/// Immutable interface configuration for one start attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelConfig {
    /// Session label shown by the platform
    pub session_name: String,
    pub mtu: u16,
    pub families: Families,
    /// One address per enabled family
    pub addresses: Vec<TunnelAddress>,
    /// Resolvers of enabled families
    pub dns_servers: Vec<IpAddr>,
    /// Raw route list, as persisted
    pub route_list: String,
    pub route_mode: RouteMode,
}

impl TunnelConfig {
    /// Validate and derive the interface configuration.
    ///
    /// A DNS entry that is not an address of its family is skipped with a
    /// warning; an empty entry adds no resolver.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let mtu = parse_mtu(&settings.mtu)?;

        let families = Families::new(settings.ipv4_enabled, settings.ipv6_enabled);
        if !families.any() {
            return Err(ConfigError::NoFamilyEnabled);
        }

        let mut addresses = Vec::new();
        let mut dns_servers = Vec::new();

        if families.ipv4 {
            addresses.push(TunnelAddress {
                address: IpAddr::V4(TUN_ADDRESS_V4),
                prefix_len: TUN_PREFIX_V4,
            });
            if let Some(dns) = parse_dns(&settings.dns_v4, AddressFamily::V4) {
                dns_servers.push(dns);
            }
        }

        if families.ipv6 {
            addresses.push(TunnelAddress {
                address: IpAddr::V6(TUN_ADDRESS_V6),
                prefix_len: TUN_PREFIX_V6,
            });
            if let Some(dns) = parse_dns(&settings.dns_v6, AddressFamily::V6) {
                dns_servers.push(dns);
            }
        }

        Ok(Self {
            session_name: settings.session_name.clone(),
            mtu,
            families,
            addresses,
            dns_servers,
            route_list: settings.excluded_ips.clone(),
            route_mode: settings.route_mode,
        })
    }
}

fn parse_mtu(raw: &str) -> Result<u16, ConfigError> {
    match raw.trim().parse::<u16>() {
        Ok(mtu) if mtu > 0 => Ok(mtu),
        _ => Err(ConfigError::InvalidMtu),
    }
}

fn parse_dns(raw: &str, family: AddressFamily) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<IpAddr>() {
        Ok(addr) if AddressFamily::of(&addr) == family => Some(addr),
        _ => {
            warn!("Ignoring {} DNS server `{}`: not an {} address", family, raw, family);
            None
        }
    }
}

/// Invalid configuration: start is refused before any interface is touched
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("server required")]
    ServerRequired,

    #[error("invalid port")]
    InvalidPort,

    #[error("invalid server address: {0}")]
    InvalidServer(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("invalid mtu")]
    InvalidMtu,

    #[error("no address family enabled")]
    NoFamilyEnabled,

    #[error("no apps selected")]
    NoAppsSelected,
}
