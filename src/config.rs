//! Persisted stream configuration.
//!
//! The router itself never writes anything; these types are what a
//! configuration file holds and what the registry hands back on shutdown.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::{TransportKind, TransportSettings};

/// Number of streams created when nothing else is asked for.
pub const DEFAULT_MAX_STREAMS: usize = 6;

/// Line ending appended to script lines.
pub const DEFAULT_LINE_TERMINATION: &str = "\r\n";

/// Everything needed to recreate one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub id: usize,
    pub linked_ports: Vec<usize>,
    pub transport: Option<TransportSettings>,
    pub startup_script_enabled: bool,
    pub startup_script: PathBuf,
    pub shutdown_script_enabled: bool,
    pub shutdown_script: PathBuf,
    pub logging: bool,
    pub log_file: PathBuf,
    pub show_incoming: bool,
    pub show_outgoing: bool,
    pub line_termination: String,
    pub connect_on_startup: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            id: 0,
            linked_ports: Vec::new(),
            transport: None,
            startup_script_enabled: false,
            startup_script: PathBuf::new(),
            shutdown_script_enabled: false,
            shutdown_script: PathBuf::new(),
            logging: false,
            log_file: PathBuf::new(),
            show_incoming: false,
            show_outgoing: false,
            line_termination: DEFAULT_LINE_TERMINATION.to_string(),
            connect_on_startup: false,
        }
    }
}

impl PortConfig {
    pub fn new(id: usize) -> PortConfig {
        PortConfig {
            id,
            ..Default::default()
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport
            .as_ref()
            .map(TransportSettings::kind)
            .unwrap_or_default()
    }
}

/// A whole configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub max_streams: usize,
    pub ports: Vec<PortConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            max_streams: DEFAULT_MAX_STREAMS,
            ports: Vec::new(),
        }
    }
}

impl RouterConfig {
    pub fn load(path: &Path) -> Result<RouterConfig> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("parsing {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("serializing configuration: {}", e)))?;
        fs::write(path, text)
            .map_err(|e| Error::Config(format!("writing {}: {}", path.display(), e)))
    }
}
