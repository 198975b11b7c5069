//! Configuration structures for uecupsd
//!
//! All fields carry serde defaults so the daemon can start without a
//! configuration file.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Default SCTP port of the CUPS control channel.
pub const DEFAULT_CUPS_PORT: u16 = 4268;

/// Default MTU for TUN devices created by the daemon.
pub const DEFAULT_TUN_MTU: u16 = 1400;

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Local address the CUPS control channel listens on
    #[serde(default = "default_cups_ip")]
    pub cups_listen_ip: IpAddr,
    /// Local port of the CUPS control channel
    #[serde(default = "default_cups_port")]
    pub cups_listen_port: u16,
    /// MTU configured on TUN devices created by the daemon
    #[serde(default = "default_tun_mtu")]
    pub tun_mtu: u16,
}

fn default_cups_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_cups_port() -> u16 {
    DEFAULT_CUPS_PORT
}

fn default_tun_mtu() -> u16 {
    DEFAULT_TUN_MTU
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cups_listen_ip: default_cups_ip(),
            cups_listen_port: default_cups_port(),
            tun_mtu: default_tun_mtu(),
        }
    }
}

impl DaemonConfig {
    /// Returns the socket address the control channel binds to.
    pub fn cups_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.cups_listen_ip, self.cups_listen_port)
    }
}
