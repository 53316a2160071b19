//! NTRIP protocol driver.

use std::io;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_native_tls::native_tls;
use tracing::{debug, info, warn};

use super::{parse_source_table, NtripSettings, NtripVersion, SourceTableEntry};
use crate::error::{Error, Result};
use crate::tcp::TCP_CONNECT_TIMEOUT;

/// How long a caster gets to answer a request.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 4096;

/// Plain TCP or TLS socket towards the caster.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

pub type NtripStream = Box<dyn AsyncReadWrite + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtripState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Talks to one caster mountpoint.
pub struct NtripClient {
    settings: NtripSettings,
    stream: Option<NtripStream>,
    /// Correction bytes that arrived together with the response header.
    pending: Vec<u8>,
    state: NtripState,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Where the header block ends and the body starts. NTRIP 1 casters may
/// answer a bare `ICY 200 OK\r\n` without the blank line.
fn header_end(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = find(buf, b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    if buf.starts_with(b"ICY") {
        if let Some(pos) = find(buf, b"\r\n") {
            return Some((pos, pos + 2));
        }
    }
    None
}

fn status_code(head: &str) -> Option<u16> {
    head.lines().next()?.split_whitespace().nth(1)?.parse().ok()
}

async fn read_response_head(stream: &mut NtripStream) -> io::Result<Vec<u8>> {
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    let mut response = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    while header_end(&response).is_none() {
        let n = match timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(read) => read?,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..n]);
    }
    Ok(response)
}

impl NtripClient {
    pub fn new(settings: NtripSettings) -> NtripClient {
        NtripClient {
            settings,
            stream: None,
            pending: Vec::new(),
            state: NtripState::Idle,
        }
    }

    pub fn settings(&self) -> &NtripSettings {
        &self.settings
    }

    pub fn state(&self) -> NtripState {
        self.state
    }

    async fn open_socket(&self) -> Result<NtripStream> {
        let endpoint = format!("{}:{}", self.settings.host, self.settings.port);
        let tcp = timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| Error::Connect(format!("timed out connecting to {}", endpoint)))?
            .map_err(|e| Error::Connect(format!("{}: {}", endpoint, e)))?;
        if !self.settings.tls {
            return Ok(Box::new(tcp));
        }

        let mut builder = native_tls::TlsConnector::builder();
        if let Some(path) = &self.settings.cert {
            let pem = tokio::fs::read(path).await.map_err(|e| {
                Error::Connect(format!("certificate {}: {}", path.display(), e))
            })?;
            let certificate = native_tls::Certificate::from_pem(&pem)
                .map_err(|e| Error::Connect(format!("certificate {}: {}", path.display(), e)))?;
            builder.add_root_certificate(certificate);
        }
        let connector = builder
            .build()
            .map_err(|e| Error::Connect(format!("TLS setup: {}", e)))?;
        let tls = tokio_native_tls::TlsConnector::from(connector)
            .connect(&self.settings.host, tcp)
            .await
            .map_err(|e| Error::Connect(format!("TLS handshake with {}: {}", endpoint, e)))?;
        Ok(Box::new(tls))
    }

    /// Request for `/{path}`, optionally carrying a GGA sentence header.
    pub fn request(&self, path: &str, http_minor: u8, gga: Option<&str>) -> String {
        let mut request = format!(
            "GET /{} HTTP/1.{}\r\nHost: {}:{}\r\nUser-Agent: NTRIP {}/{}\r\nNtrip-Version: {}\r\n",
            path,
            http_minor,
            self.settings.host,
            self.settings.port,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.settings.version.header_value()
        );
        if self.settings.auth {
            let credentials = format!("{}:{}", self.settings.username, self.settings.password);
            request.push_str(&format!(
                "Authorization: Basic {}\r\n",
                STANDARD.encode(credentials)
            ));
        }
        if let Some(gga) = gga {
            request.push_str(&format!("Ntrip-GGA: {}\r\n", gga.trim_end()));
        }
        request.push_str("Connection: close\r\n\r\n");
        request
    }

    fn mountpoint_request(&self, gga: Option<&str>) -> String {
        self.request(
            &self.settings.mountpoint,
            self.settings.version.http_minor(),
            gga,
        )
    }

    /// Opens the socket and requests the mountpoint. Only a 401 answer is
    /// treated as a refusal; casters often stream right after other codes.
    pub async fn connect(&mut self) -> Result<()> {
        self.settings.validate()?;
        self.state = NtripState::Connecting;
        match self.handshake().await {
            Ok(()) => {
                self.state = NtripState::Connected;
                Ok(())
            }
            Err(e) => {
                self.stream = None;
                self.state = NtripState::Idle;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let mut stream = self.open_socket().await?;
        let gga = self.settings.fixed_position.then(|| self.settings.create_gga_string());
        let header_gga = match self.settings.version {
            NtripVersion::V2 => gga.as_deref(),
            NtripVersion::V1 => None,
        };
        let request = self.mountpoint_request(header_gga);
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| Error::Connect(format!("sending request: {}", e)))?;

        let response = read_response_head(&mut stream)
            .await
            .map_err(|e| Error::Connect(format!("reading response: {}", e)))?;
        if response.is_empty() {
            return Err(Error::Connect(format!(
                "no response from {}:{}",
                self.settings.host, self.settings.port
            )));
        }

        let (head, body) = match header_end(&response) {
            Some((head_len, body_start)) => (
                String::from_utf8_lossy(&response[..head_len]).into_owned(),
                response[body_start..].to_vec(),
            ),
            None => (String::from_utf8_lossy(&response).into_owned(), Vec::new()),
        };
        if status_code(&head) == Some(401) {
            let body_text = String::from_utf8_lossy(&body).trim().to_string();
            let reason = if body_text.is_empty() {
                head.lines().next().unwrap_or_default().to_string()
            } else {
                body_text
            };
            return Err(Error::Authentication(reason));
        }

        info!(
            "Connected to NTRIP caster {}:{}/{} ({}).",
            self.settings.host,
            self.settings.port,
            self.settings.mountpoint,
            head.lines().next().unwrap_or_default()
        );
        self.pending = body;
        self.stream = Some(stream);

        if let (NtripVersion::V1, Some(gga)) = (self.settings.version, gga) {
            self.send_nmea(&gga).await?;
        }
        Ok(())
    }

    /// Uploads a position. Version 2 casters get a fresh mountpoint request
    /// carrying the sentence as `Ntrip-GGA`; version 1 casters get the raw
    /// sentence on the socket. Returns the length of the sentence itself.
    pub async fn send_nmea(&mut self, sentence: &str) -> Result<usize> {
        let payload = match self.settings.version {
            NtripVersion::V2 => self.mountpoint_request(Some(sentence)),
            NtripVersion::V1 => format!("{}\r\n", sentence.trim_end()),
        };
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Connect("NTRIP client is not connected".into()))?;
        stream.write_all(payload.as_bytes()).await?;
        debug!("Sent GGA to caster {}.", self.settings.host);
        Ok(sentence.len())
    }

    /// Reads correction data. Returns 0 when the caster closed the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Connect("NTRIP client is not connected".into()))?;
        Ok(stream.read(buf).await?)
    }

    /// Fetches the caster's source table over a separate short-lived
    /// connection and remembers it in the settings.
    pub async fn get_source_table(&mut self) -> Result<Vec<SourceTableEntry>> {
        self.settings.validate_caster()?;
        let raw = self
            .fetch_source_table()
            .await
            .map_err(|e| Error::SourceTable(e.to_string()))?;
        let response = String::from_utf8_lossy(&raw);
        match status_code(&response) {
            Some(200) => {}
            status => {
                warn!(
                    "Caster {} answered the source table request with {:?}.",
                    self.settings.host, status
                );
                return Ok(Vec::new());
            }
        }
        let table = parse_source_table(&response);
        debug!(
            "Caster {} lists {} mountpoints.",
            self.settings.host,
            table.len()
        );
        self.settings.source_table = table.clone();
        Ok(table)
    }

    async fn fetch_source_table(&self) -> Result<Vec<u8>> {
        let mut stream = self.open_socket().await?;
        stream
            .write_all(self.request("", 1, None).as_bytes())
            .await?;

        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        let mut response = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        while find(&response, b"ENDSOURCETABLE").is_none() {
            let n = match timeout_at(deadline, stream.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => break,
            };
            if n == 0 {
                break;
            }
            response.extend_from_slice(&chunk[..n]);
        }
        let _ = stream.shutdown().await;
        Ok(response)
    }

    /// Closes the caster connection. Closing twice is an error.
    pub async fn close(&mut self) -> Result<()> {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| Error::Closing("NTRIP connection is not open".into()))?;
        self.pending.clear();
        self.state = NtripState::Closed;
        match stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::Closing(e.to_string())),
        }
    }
}
