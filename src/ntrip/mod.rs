//! NTRIP client: caster settings, the request/response handshake, source
//! table discovery and GGA keep-alives.

mod client;
mod gga;
mod source_table;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use client::{NtripClient, NtripState, NtripStream};
pub use gga::{create_gga_string, create_gga_string_at, nmea_checksum};
pub use source_table::{parse_source_table, SourceTableEntry};

/// Default caster port.
pub const NTRIP_DEFAULT_PORT: u16 = 2101;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NtripVersion {
    #[serde(rename = "1")]
    V1,
    #[default]
    #[serde(rename = "2")]
    V2,
}

impl NtripVersion {
    pub fn http_minor(self) -> u8 {
        match self {
            NtripVersion::V1 => 0,
            NtripVersion::V2 => 1,
        }
    }

    pub fn header_value(self) -> &'static str {
        match self {
            NtripVersion::V1 => "Ntrip/1.0",
            NtripVersion::V2 => "Ntrip/2.0",
        }
    }
}

/// Caster connection parameters.
///
/// Changing these while connected has no effect until the next connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NtripSettings {
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
    pub auth: bool,
    pub username: String,
    /// Stored base64-encoded at rest.
    #[serde(with = "password_at_rest")]
    pub password: String,
    pub tls: bool,
    /// Extra PEM root certificate trusted for TLS.
    pub cert: Option<PathBuf>,
    pub version: NtripVersion,
    pub fixed_position: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub height: f64,
    /// Last table retrieved from the caster.
    #[serde(skip)]
    pub source_table: Vec<SourceTableEntry>,
}

impl Default for NtripSettings {
    fn default() -> Self {
        NtripSettings {
            host: String::new(),
            port: NTRIP_DEFAULT_PORT,
            mountpoint: String::new(),
            auth: false,
            username: String::new(),
            password: String::new(),
            tls: false,
            cert: None,
            version: NtripVersion::V2,
            fixed_position: false,
            latitude: 0.0,
            longitude: 0.0,
            height: 0.0,
            source_table: Vec::new(),
        }
    }
}

impl NtripSettings {
    pub fn new(host: &str, port: u16, mountpoint: &str) -> NtripSettings {
        NtripSettings {
            host: host.to_string(),
            port,
            mountpoint: mountpoint.to_string(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> NtripSettings {
        self.auth = true;
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    /// Enough to reach the caster root (source table).
    pub fn validate_caster(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::MissingSettings("NTRIP host is not set".into()));
        }
        if self.port == 0 {
            return Err(Error::Settings("NTRIP port is not set".into()));
        }
        if self.auth && self.username.is_empty() {
            return Err(Error::MissingSettings(
                "NTRIP authentication enabled without a username".into(),
            ));
        }
        Ok(())
    }

    /// Enough to stream from a mountpoint.
    pub fn validate(&self) -> Result<()> {
        self.validate_caster()?;
        if self.mountpoint.trim().is_empty() {
            return Err(Error::MissingSettings("NTRIP mountpoint is not set".into()));
        }
        Ok(())
    }

    /// GGA for the configured fixed position, stamped now.
    pub fn create_gga_string(&self) -> String {
        create_gga_string(self.latitude, self.longitude, self.height)
    }
}

impl fmt::Display for NtripSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = match self.version {
            NtripVersion::V1 => "v1",
            NtripVersion::V2 => "v2",
        };
        write!(
            f,
            "NTRIP {}:{}/{} ({}",
            self.host, self.port, self.mountpoint, version
        )?;
        if self.tls {
            write!(f, ", TLS")?;
        }
        if self.auth {
            write!(f, ", user {}", self.username)?;
        }
        write!(f, ")")
    }
}

mod password_at_rest {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(password: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(password))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded.as_bytes()).map_err(de::Error::custom)?;
        String::from_utf8(bytes).map_err(de::Error::custom)
    }
}
