//! One-line stream definitions given on the command line.
//!
//! ```text
//! <kind>://<params>[#<linked id>,<linked id>,...]
//!
//! serial://port[:baud[:parity[:stopbits[:bytesize[:rtscts]]]]]
//! tcpcli://host:port
//! tcpsrv://port            (or host:port, host ignored)
//! udp://port               (or host:port, broadcast)
//! udpspe://host:port
//! ntrip://[user:pass@]host:port/mountpoint
//! ```

use crate::config::PortConfig;
use crate::error::{Error, Result};
use crate::ntrip::NtripSettings;
use crate::serial::{Parity, SerialSettings, StopBits};
use crate::tcp::TcpSettings;
use crate::transport::TransportSettings;
use crate::udp::UdpSettings;

fn config_error(line: &str, reason: impl std::fmt::Display) -> Error {
    Error::Config(format!("'{}': {}", line, reason))
}

fn parse_port(value: &str) -> std::result::Result<u16, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("invalid port '{}'", value))
}

fn parse_host_port(value: &str) -> std::result::Result<(String, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got '{}'", value))?;
    if host.is_empty() {
        return Err(format!("missing host in '{}'", value));
    }
    Ok((host.to_string(), parse_port(port)?))
}

/// `port` alone or `host:port`; the host is returned empty when absent.
fn parse_optional_host_port(value: &str) -> std::result::Result<(String, u16), String> {
    match value.rsplit_once(':') {
        Some(_) => parse_host_port(value),
        None => Ok((String::new(), parse_port(value)?)),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_serial(params: &str) -> std::result::Result<SerialSettings, String> {
    let mut fields = params.split(':');
    let port = fields.next().unwrap_or_default().trim();
    if port.is_empty() {
        return Err("missing serial port name".into());
    }
    let mut settings = SerialSettings::new(port, 9600);
    if let Some(baud) = fields.next() {
        settings.baudrate = baud
            .trim()
            .parse()
            .map_err(|_| format!("invalid baud rate '{}'", baud))?;
    }
    if let Some(parity) = fields.next() {
        settings.parity =
            Parity::from_letter(parity.trim()).ok_or_else(|| format!("invalid parity '{}'", parity))?;
    }
    if let Some(stop_bits) = fields.next() {
        settings.stop_bits = StopBits::parse(stop_bits.trim())
            .ok_or_else(|| format!("invalid stop bits '{}'", stop_bits))?;
    }
    if let Some(byte_size) = fields.next() {
        settings.byte_size = byte_size
            .trim()
            .parse()
            .map_err(|_| format!("invalid byte size '{}'", byte_size))?;
    }
    if let Some(rtscts) = fields.next() {
        settings.rtscts = parse_bool(rtscts.trim()).ok_or_else(|| format!("invalid rtscts '{}'", rtscts))?;
    }
    if fields.next().is_some() {
        return Err("too many serial fields".into());
    }
    settings.validate().map_err(|e| e.to_string())?;
    Ok(settings)
}

fn parse_ntrip(params: &str) -> std::result::Result<NtripSettings, String> {
    let (credentials, address) = match params.rsplit_once('@') {
        Some((credentials, address)) => (Some(credentials), address),
        None => (None, params),
    };
    let (host_port, mountpoint) = address
        .split_once('/')
        .ok_or_else(|| "expected host:port/mountpoint".to_string())?;
    let (host, port) = parse_host_port(host_port)?;
    if mountpoint.is_empty() {
        return Err("missing mountpoint".into());
    }
    let settings = NtripSettings::new(&host, port, mountpoint);
    match credentials {
        Some(credentials) => {
            let (user, password) = credentials
                .split_once(':')
                .ok_or_else(|| "expected user:password before '@'".to_string())?;
            Ok(settings.with_credentials(user, password))
        }
        None => Ok(settings),
    }
}

fn parse_links(
    value: &str,
    id: usize,
    max_streams: usize,
) -> std::result::Result<Vec<usize>, String> {
    let mut links = Vec::new();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let target: usize = item
            .parse()
            .map_err(|_| format!("invalid linked stream '{}'", item))?;
        if target >= max_streams {
            return Err(format!(
                "linked stream {} out of range (max {})",
                target,
                max_streams - 1
            ));
        }
        if target == id {
            return Err(format!("stream {} cannot link to itself", id));
        }
        if !links.contains(&target) {
            links.push(target);
        }
    }
    Ok(links)
}

/// Parses the definition of stream `id`. Nothing is returned unless the
/// whole line is valid.
pub fn parse_stream_line(id: usize, line: &str, max_streams: usize) -> Result<PortConfig> {
    let line = line.trim();
    let (body, links) = match line.split_once('#') {
        Some((body, links)) => (body, Some(links)),
        None => (line, None),
    };
    let (kind, params) = body
        .split_once("://")
        .ok_or_else(|| config_error(line, "expected <kind>://<params>"))?;

    let transport = match kind.to_ascii_lowercase().as_str() {
        "serial" => TransportSettings::Serial(parse_serial(params).map_err(|e| config_error(line, e))?),
        "tcpcli" => {
            let (host, port) = parse_host_port(params).map_err(|e| config_error(line, e))?;
            TransportSettings::Tcp(TcpSettings::client(&host, port))
        }
        "tcpsrv" => {
            let (_, port) = parse_optional_host_port(params).map_err(|e| config_error(line, e))?;
            TransportSettings::Tcp(TcpSettings::server(port))
        }
        "udp" => {
            let (host, port) = parse_optional_host_port(params).map_err(|e| config_error(line, e))?;
            let mut settings = UdpSettings::broadcast(port);
            settings.host = host;
            TransportSettings::Udp(settings)
        }
        "udpspe" => {
            let (host, port) = parse_host_port(params).map_err(|e| config_error(line, e))?;
            TransportSettings::Udp(UdpSettings::specific(&host, port))
        }
        "ntrip" => TransportSettings::Ntrip(parse_ntrip(params).map_err(|e| config_error(line, e))?),
        other => return Err(config_error(line, format!("unknown stream kind '{}'", other))),
    };

    let linked_ports = match links {
        Some(links) => parse_links(links, id, max_streams).map_err(|e| config_error(line, e))?,
        None => Vec::new(),
    };

    Ok(PortConfig {
        id,
        linked_ports,
        transport: Some(transport),
        connect_on_startup: true,
        ..PortConfig::new(id)
    })
}
