//! TCP client/server settings.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::info;

use crate::error::{Error, Result};

/// How long a client waits for the remote end to accept.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TcpMode {
    #[default]
    Client,
    Server,
}

/// Parameters of a TCP endpoint.
///
/// In server mode the host is meaningless: the listener binds every local
/// address on `port` and the host field is kept empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    pub host: String,
    pub port: u16,
    pub mode: TcpMode,
}

/// A freshly opened TCP handle.
pub enum TcpHandle {
    Client(TcpStream),
    Server(TcpListener),
}

impl TcpSettings {
    pub fn client(host: &str, port: u16) -> TcpSettings {
        TcpSettings {
            host: host.to_string(),
            port,
            mode: TcpMode::Client,
        }
    }

    pub fn server(port: u16) -> TcpSettings {
        TcpSettings {
            host: String::new(),
            port,
            mode: TcpMode::Server,
        }
    }

    pub fn set_mode(&mut self, mode: TcpMode) {
        self.mode = mode;
        if mode == TcpMode::Server {
            self.host.clear();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == TcpMode::Client {
            if self.host.trim().is_empty() {
                return Err(Error::MissingSettings("TCP host is not set".into()));
            }
            if self.port == 0 {
                return Err(Error::Settings("TCP client needs a port".into()));
            }
        }
        Ok(())
    }

    /// Connects (client) or starts listening (server).
    pub async fn connect(&self) -> Result<TcpHandle> {
        self.validate()?;
        match self.mode {
            TcpMode::Client => Ok(TcpHandle::Client(self.open_client().await?)),
            TcpMode::Server => {
                let listener = TcpListener::bind(("0.0.0.0", self.port))
                    .await
                    .map_err(|e| Error::Connect(format!("bind on port {}: {}", self.port, e)))?;
                info!("Open TCP server on port {}.", self.port);
                Ok(TcpHandle::Server(listener))
            }
        }
    }

    /// Resolves the host and connects within [`TCP_CONNECT_TIMEOUT`].
    pub async fn open_client(&self) -> Result<TcpStream> {
        let endpoint = format!("{}:{}", self.host, self.port);
        let stream = timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| Error::Connect(format!("timed out connecting to {}", endpoint)))?
            .map_err(|e| Error::Connect(format!("{}: {}", endpoint, e)))?;
        info!("Open TCP connection to {}.", endpoint);
        Ok(stream)
    }
}

impl fmt::Display for TcpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            TcpMode::Client => write!(f, "TCP client {}:{}", self.host, self.port),
            TcpMode::Server => write!(f, "TCP server on port {}", self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_mode_clears_host() {
        let mut settings = TcpSettings::client("10.0.0.1", 2101);
        settings.set_mode(TcpMode::Server);
        assert!(settings.host.is_empty());
        assert_eq!(settings.to_string(), "TCP server on port 2101");
    }

    #[test]
    fn test_client_requires_host() {
        let settings = TcpSettings::client("", 2101);
        assert!(matches!(settings.validate(), Err(Error::MissingSettings(_))));
    }

    #[tokio::test]
    async fn test_client_connect_failure() {
        // Grab a free port, then close it so nobody listens there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = TcpSettings::client("127.0.0.1", port);
        assert!(matches!(settings.connect().await, Err(Error::Connect(_))));
    }

    #[tokio::test]
    async fn test_client_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let settings = TcpSettings::client("127.0.0.1", port);
        let handle = settings.connect().await.unwrap();
        assert!(matches!(handle, TcpHandle::Client(_)));
    }
}
