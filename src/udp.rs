//! UDP socket settings.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, UdpSocket};
use tracing::info;

use crate::error::{Error, Result};

/// Which directions of a UDP endpoint are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UdpDataFlow {
    TransmitOnly,
    ListenOnly,
    #[default]
    Both,
}

impl UdpDataFlow {
    pub fn receives(self) -> bool {
        self != UdpDataFlow::TransmitOnly
    }

    pub fn transmits(self) -> bool {
        self != UdpDataFlow::ListenOnly
    }
}

/// Parameters of a UDP endpoint.
///
/// Without a specific host the socket binds the wildcard address on `port`
/// and talks broadcast; with one, sends always go to `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpSettings {
    pub host: String,
    pub port: u16,
    pub dataflow: UdpDataFlow,
    pub specific_host: bool,
}

impl UdpSettings {
    pub fn broadcast(port: u16) -> UdpSettings {
        UdpSettings {
            port,
            ..Default::default()
        }
    }

    pub fn specific(host: &str, port: u16) -> UdpSettings {
        UdpSettings {
            host: host.to_string(),
            port,
            dataflow: UdpDataFlow::Both,
            specific_host: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.specific_host {
            if self.host.trim().is_empty() {
                return Err(Error::MissingSettings("UDP host is not set".into()));
            }
            if self.port == 0 {
                return Err(Error::Settings("UDP specific host needs a port".into()));
            }
        }
        Ok(())
    }

    /// Opens the socket and resolves the default send address.
    pub async fn connect(&self) -> Result<(UdpSocket, SocketAddr)> {
        self.validate()?;
        if self.specific_host {
            let target = self.resolve_target().await?;
            let bind_addr: SocketAddr = if target.is_ipv6() {
                "[::]:0".parse().map_err(|e| Error::Connect(format!("{}", e)))?
            } else {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            };
            let socket = UdpSocket::bind(bind_addr)
                .await
                .map_err(|e| Error::Connect(format!("UDP socket: {}", e)))?;
            info!("Open UDP socket towards {}.", target);
            Ok((socket, target))
        } else {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port))
                .await
                .map_err(|e| Error::Connect(format!("UDP bind on port {}: {}", self.port, e)))?;
            socket
                .set_broadcast(true)
                .map_err(|e| Error::Connect(format!("UDP broadcast: {}", e)))?;
            info!("Open UDP listener on port {}.", self.port);
            Ok((socket, (Ipv4Addr::BROADCAST, self.port).into()))
        }
    }

    async fn resolve_target(&self) -> Result<SocketAddr> {
        lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::Connect(format!("{}: {}", self.host, e)))?
            .next()
            .ok_or_else(|| Error::Connect(format!("{} did not resolve", self.host)))
    }
}

impl fmt::Display for UdpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flow = match self.dataflow {
            UdpDataFlow::TransmitOnly => "transmit",
            UdpDataFlow::ListenOnly => "listen",
            UdpDataFlow::Both => "both",
        };
        if self.specific_host {
            write!(f, "UDP {}:{} ({})", self.host, self.port, flow)
        } else {
            write!(f, "UDP broadcast port {} ({})", self.port, flow)
        }
    }
}
