//! Seams to the tunnel subsystem and the host's network state.
//!
//! The engine never speaks a VPN protocol itself. It issues connect and
//! disconnect commands and reacts to the status events the tunnel reports on
//! an mpsc channel handed to the orchestrator at construction.

use std::net::{SocketAddr, UdpSocket};

use crate::error::SdkError;

/// Status reported asynchronously by the tunnel subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    /// The public relay network accepts `vpn`/`vpn`
    fn default() -> Self {
        Self {
            username: "vpn".to_string(),
            password: "vpn".to_string(),
        }
    }
}

pub trait TunnelController: Send + Sync {
    /// Start establishing a tunnel. Returns once the command is issued; the
    /// outcome arrives as a `TunnelStatus`. `SdkError::Tunnel` here counts as
    /// a failed attempt; any other error ends the connect sequence.
    fn connect(&self, hostname: &str, credentials: &Credentials) -> Result<(), SdkError>;

    fn disconnect(&self);
}

/// "Is any network transport up?"
pub trait ConnectivityCheck: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Asks the OS routing table for a route to a public address. Connecting a
/// UDP socket sends nothing, it only fails when no interface can reach it.
#[derive(Debug, Clone)]
pub struct RouteConnectivity {
    target: SocketAddr,
}

impl RouteConnectivity {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl Default for RouteConnectivity {
    fn default() -> Self {
        Self::new(SocketAddr::from(([1, 1, 1, 1], 53)))
    }
}

impl ConnectivityCheck for RouteConnectivity {
    fn is_online(&self) -> bool {
        let socket = match UdpSocket::bind("0.0.0.0:0") {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Connectivity check could not bind: {}", e);
                return false;
            }
        };
        match socket.connect(self.target) {
            Ok(()) => true,
            Err(e) => {
                log::info!("No route to {}: {}", self.target, e);
                false
            }
        }
    }
}
