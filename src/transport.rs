//! This module contains the transport settings a stream can be configured with and the live
//! transport handle its worker reads from and writes to (serial, TCP client/server, UDP or NTRIP).

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_serial::SerialStream;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ntrip::{NtripClient, NtripSettings};
use crate::serial::{SerialSettings, SERIAL_READ_TIMEOUT};
use crate::tcp::{TcpHandle, TcpSettings};
use crate::udp::{UdpDataFlow, UdpSettings};

const READ_BUFFER_SIZE: usize = 4096;
const UDP_BUFFER_SIZE: usize = 65536;

/// First wait before a TCP client tries to reconnect; doubles up to the cap.
pub const RECONNECT_BACKOFF_START: Duration = Duration::from_millis(100);
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportKind {
    #[default]
    None,
    Serial,
    Tcp,
    Udp,
    Ntrip,
}

/// Settings of the transport a stream is configured to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportSettings {
    Serial(SerialSettings),
    Tcp(TcpSettings),
    Udp(UdpSettings),
    Ntrip(NtripSettings),
}

impl TransportSettings {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportSettings::Serial(_) => TransportKind::Serial,
            TransportSettings::Tcp(_) => TransportKind::Tcp,
            TransportSettings::Udp(_) => TransportKind::Udp,
            TransportSettings::Ntrip(_) => TransportKind::Ntrip,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TransportSettings::Serial(s) => s.validate(),
            TransportSettings::Tcp(s) => s.validate(),
            TransportSettings::Udp(s) => s.validate(),
            TransportSettings::Ntrip(s) => s.validate(),
        }
    }

    /// Opens the transport described by these settings.
    ///
    /// This will return an error if the connection cannot be made.
    pub async fn connect(&self) -> Result<Transport> {
        match self {
            TransportSettings::Serial(settings) => {
                let port = settings.connect()?;
                let (rd, wr) = tokio::io::split(port);
                Ok(Transport::Serial {
                    reader: BufReader::new(rd),
                    writer: wr,
                    line: Vec::new(),
                })
            }
            TransportSettings::Tcp(settings) => match settings.connect().await? {
                TcpHandle::Client(stream) => Ok(Transport::TcpClient {
                    settings: settings.clone(),
                    stream: Some(stream),
                    backoff: RECONNECT_BACKOFF_START,
                    retry_at: Instant::now(),
                    attempt: None,
                }),
                TcpHandle::Server(listener) => Ok(Transport::TcpServer {
                    listener,
                    client: None,
                }),
            },
            TransportSettings::Udp(settings) => {
                let (socket, target) = settings.connect().await?;
                Ok(Transport::Udp {
                    socket,
                    dataflow: settings.dataflow,
                    specific_host: settings.specific_host,
                    target,
                    last_sender: None,
                })
            }
            TransportSettings::Ntrip(settings) => {
                let mut client = NtripClient::new(settings.clone());
                client.connect().await?;
                Ok(Transport::Ntrip(client))
            }
        }
    }
}

impl fmt::Display for TransportSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSettings::Serial(s) => write!(f, "{}", s),
            TransportSettings::Tcp(s) => write!(f, "{}", s),
            TransportSettings::Udp(s) => write!(f, "{}", s),
            TransportSettings::Ntrip(s) => write!(f, "{}", s),
        }
    }
}

/// A live transport owned by a stream worker.
pub enum Transport {
    /// Incoming serial data is framed by newlines; `line` keeps a partial
    /// line across reads.
    Serial {
        reader: BufReader<ReadHalf<SerialStream>>,
        writer: WriteHalf<SerialStream>,
        line: Vec<u8>,
    },
    /// Reconnects on its own whenever the peer goes away. The next attempt
    /// time and an attempt in flight survive a dropped `read`.
    TcpClient {
        settings: TcpSettings,
        stream: Option<TcpStream>,
        backoff: Duration,
        retry_at: Instant,
        attempt: Option<JoinHandle<Result<TcpStream>>>,
    },
    /// Serves exactly one client at a time.
    TcpServer {
        listener: TcpListener,
        client: Option<(TcpStream, SocketAddr)>,
    },
    Udp {
        socket: UdpSocket,
        dataflow: UdpDataFlow,
        specific_host: bool,
        target: SocketAddr,
        last_sender: Option<SocketAddr>,
    },
    Ntrip(NtripClient),
}

fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

async fn shutdown_tcp(stream: &mut TcpStream) -> Result<()> {
    match stream.shutdown().await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(Error::Closing(e.to_string())),
    }
}

impl Transport {
    /// Local address of listening transports.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::TcpServer { listener, .. } => listener.local_addr().ok(),
            Transport::Udp { socket, .. } => socket.local_addr().ok(),
            _ => None,
        }
    }

    /// Waits for the next chunk of incoming data.
    ///
    /// `Ok(None)` means the call made progress without data (a reconnect,
    /// a newly accepted client, a serial timeout). Every branch is safe to
    /// drop mid-way, so callers may race it against other events.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        match self {
            Transport::Serial { reader, line, .. } => {
                match reader.read_until(b'\n', line).await {
                    Ok(0) if line.is_empty() => {
                        sleep(SERIAL_READ_TIMEOUT).await;
                        Ok(None)
                    }
                    Ok(_) => Ok(Some(Bytes::from(std::mem::take(line)))),
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Transport::TcpClient {
                settings,
                stream,
                backoff,
                retry_at,
                attempt,
            } => {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                let outcome = match stream.as_mut() {
                    Some(conn) => Some(conn.read(&mut buf).await),
                    None => None,
                };
                match outcome {
                    None => {
                        if attempt.is_none() {
                            sleep_until(*retry_at).await;
                            let target = settings.clone();
                            *attempt = Some(tokio::spawn(async move { target.open_client().await }));
                        }
                        let joined = match attempt.as_mut() {
                            Some(task) => task.await,
                            None => return Ok(None),
                        };
                        *attempt = None;
                        let failure = match joined {
                            Ok(Ok(conn)) => {
                                info!("Reconnected to {}:{}.", settings.host, settings.port);
                                *stream = Some(conn);
                                *backoff = RECONNECT_BACKOFF_START;
                                return Ok(None);
                            }
                            Ok(Err(e)) => e.to_string(),
                            Err(join_error) => join_error.to_string(),
                        };
                        debug!("Reconnect failed: {}", failure);
                        *backoff = (*backoff * 2).min(RECONNECT_BACKOFF_MAX);
                        *retry_at = Instant::now() + *backoff;
                        Ok(None)
                    }
                    Some(Ok(0)) => {
                        info!(
                            "{}:{} closed the connection, reconnecting.",
                            settings.host, settings.port
                        );
                        *stream = None;
                        *retry_at = Instant::now() + *backoff;
                        Ok(None)
                    }
                    Some(Ok(n)) => {
                        buf.truncate(n);
                        Ok(Some(Bytes::from(buf)))
                    }
                    Some(Err(e)) if is_peer_closed(&e) => {
                        info!(
                            "{}:{} dropped the connection ({}), reconnecting.",
                            settings.host, settings.port, e
                        );
                        *stream = None;
                        *retry_at = Instant::now() + *backoff;
                        Ok(None)
                    }
                    Some(Err(e)) => Err(e.into()),
                }
            }
            Transport::TcpServer { listener, client } => {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                let outcome = match client.as_mut() {
                    Some((conn, _)) => Some(conn.read(&mut buf).await),
                    None => None,
                };
                match outcome {
                    None => {
                        let (conn, addr) = listener.accept().await?;
                        info!("Accepted client connection at {}", addr);
                        *client = Some((conn, addr));
                        Ok(None)
                    }
                    Some(Ok(n)) if n > 0 => {
                        buf.truncate(n);
                        Ok(Some(Bytes::from(buf)))
                    }
                    Some(Ok(_)) => {
                        if let Some((_, addr)) = client.take() {
                            info!("Client {} disconnected, waiting for a new one.", addr);
                        }
                        Ok(None)
                    }
                    Some(Err(e)) if is_peer_closed(&e) => {
                        if let Some((_, addr)) = client.take() {
                            info!("Client {} dropped ({}), waiting for a new one.", addr, e);
                        }
                        Ok(None)
                    }
                    Some(Err(e)) => Err(e.into()),
                }
            }
            Transport::Udp {
                socket,
                dataflow,
                last_sender,
                ..
            } => {
                if !dataflow.receives() {
                    std::future::pending::<()>().await;
                }
                let mut buf = vec![0u8; UDP_BUFFER_SIZE];
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        *last_sender = Some(from);
                        buf.truncate(n);
                        Ok(Some(Bytes::from(buf)))
                    }
                    // ICMP unreachable from an earlier send on some platforms
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Transport::Ntrip(client) => {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                let n = client.read(&mut buf).await?;
                if n == 0 {
                    return Err(Error::Connect(format!(
                        "caster {} closed the connection",
                        client.settings().host
                    )));
                }
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
        }
    }

    /// Writes one queued message. Returns how many bytes went out, which is
    /// zero when the transport has nowhere to send it right now.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        match self {
            Transport::Serial { writer, .. } => {
                writer.write_all(data).await?;
                Ok(data.len())
            }
            Transport::TcpClient {
                stream,
                backoff,
                retry_at,
                ..
            } => {
                let outcome = match stream.as_mut() {
                    Some(conn) => Some(conn.write_all(data).await),
                    None => None,
                };
                match outcome {
                    None => {
                        debug!("Dropping {} bytes while reconnecting.", data.len());
                        Ok(0)
                    }
                    Some(Ok(())) => Ok(data.len()),
                    Some(Err(e)) if is_peer_closed(&e) => {
                        *stream = None;
                        *retry_at = Instant::now() + *backoff;
                        Ok(0)
                    }
                    Some(Err(e)) => Err(e.into()),
                }
            }
            Transport::TcpServer { client, .. } => {
                let outcome = match client.as_mut() {
                    Some((conn, _)) => Some(conn.write_all(data).await),
                    None => None,
                };
                match outcome {
                    None => Ok(0),
                    Some(Ok(())) => Ok(data.len()),
                    Some(Err(e)) if is_peer_closed(&e) => {
                        *client = None;
                        Ok(0)
                    }
                    Some(Err(e)) => Err(e.into()),
                }
            }
            Transport::Udp {
                socket,
                dataflow,
                specific_host,
                target,
                last_sender,
            } => {
                if !dataflow.transmits() {
                    return Ok(0);
                }
                let destination = if *specific_host {
                    *target
                } else {
                    last_sender.unwrap_or(*target)
                };
                Ok(socket.send_to(data, destination).await?)
            }
            Transport::Ntrip(client) => {
                let text = String::from_utf8_lossy(data);
                if text.contains("GGA") {
                    client.send_nmea(&text).await
                } else {
                    Ok(0)
                }
            }
        }
    }

    /// Releases the transport.
    pub async fn close(self) -> Result<()> {
        match self {
            Transport::Serial { mut writer, .. } => writer
                .flush()
                .await
                .map_err(|e| Error::Closing(e.to_string())),
            Transport::TcpClient {
                stream, attempt, ..
            } => {
                if let Some(task) = attempt {
                    task.abort();
                }
                match stream {
                    Some(mut conn) => shutdown_tcp(&mut conn).await,
                    None => Ok(()),
                }
            }
            Transport::TcpServer { client, .. } => match client {
                Some((mut conn, _)) => shutdown_tcp(&mut conn).await,
                None => Ok(()),
            },
            Transport::Udp { .. } => Ok(()),
            Transport::Ntrip(mut client) => client.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_serialize_with_kind_tag() {
        let settings = TransportSettings::Tcp(TcpSettings::client("10.0.0.1", 2101));
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["kind"], "tcp");
        assert_eq!(json["host"], "10.0.0.1");

        let back: TransportSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back, settings);
        assert_eq!(back.kind(), TransportKind::Tcp);
    }

    #[tokio::test]
    async fn test_tcp_server_accepts_then_reads() {
        let settings = TransportSettings::Tcp(TcpSettings::server(0));
        let mut transport = settings.connect().await.unwrap();
        let addr = transport.local_addr().unwrap();

        let mut peer = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        // First read accepts the client
        assert!(transport.read().await.unwrap().is_none());

        peer.write_all(b"hello").await.unwrap();
        let data = transport.read().await.unwrap().unwrap();
        assert_eq!(&data[..], b"hello");

        assert_eq!(transport.write(b"back").await.unwrap(), 4);
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");

        drop(peer);
        assert!(transport.read().await.unwrap().is_none());
        // No client any more: outgoing data has nowhere to go
        assert_eq!(transport.write(b"lost").await.unwrap(), 0);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_client_reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let settings = TransportSettings::Tcp(TcpSettings::client("127.0.0.1", port));
        let mut transport = settings.connect().await.unwrap();

        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        // Peer close is noticed, then the next read reconnects
        assert!(transport.read().await.unwrap().is_none());
        assert!(transport.read().await.unwrap().is_none());

        let (mut second, _) = listener.accept().await.unwrap();
        second.write_all(b"again").await.unwrap();
        let data = transport.read().await.unwrap().unwrap();
        assert_eq!(&data[..], b"again");
    }

    #[tokio::test]
    async fn test_tcp_client_reconnects_when_reads_keep_being_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let settings = TransportSettings::Tcp(TcpSettings::client("127.0.0.1", addr.port()));
        let mut transport = settings.connect().await.unwrap();
        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        drop(listener);

        // Short reads race like the worker's select: none of them may
        // restart the reconnect wait
        let outage = Instant::now() + Duration::from_secs(3);
        while Instant::now() < outage {
            let _ = tokio::time::timeout(Duration::from_millis(50), transport.read()).await;
        }

        let listener = TcpListener::bind(addr).await.unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                tokio::select! {
                    accepted = listener.accept() => break accepted,
                    _ = tokio::time::timeout(Duration::from_millis(50), transport.read()) => {}
                }
            }
        })
        .await
        .expect("no reconnect after the outage");
        let (mut second, _) = accepted.unwrap();

        second.write_all(b"back").await.unwrap();
        let data = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(data) = transport.read().await.unwrap() {
                    break data;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(&data[..], b"back");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_replies_to_last_sender() {
        let settings = TransportSettings::Udp(UdpSettings::broadcast(0));
        let mut transport = settings.connect().await.unwrap();
        let port = transport.local_addr().unwrap().port();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"ping", ("127.0.0.1", port)).await.unwrap();
        let data = transport.read().await.unwrap().unwrap();
        assert_eq!(&data[..], b"ping");

        assert_eq!(transport.write(b"pong").await.unwrap(), 4);
        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_udp_listen_only_drops_outgoing() {
        let mut settings = UdpSettings::broadcast(0);
        settings.dataflow = UdpDataFlow::ListenOnly;
        let mut transport = TransportSettings::Udp(settings).connect().await.unwrap();
        assert_eq!(transport.write(b"nothing").await.unwrap(), 0);
    }
}
