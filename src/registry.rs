//! The fixed set of streams and the fabric that connects them.

use tracing::{error, info, warn};

use crate::cmdline::parse_stream_line;
use crate::config::{PortConfig, RouterConfig};
use crate::error::{Error, Result};
use crate::fabric::LinkFabric;
use crate::stream::Stream;

/// Where the current stream configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    File,
    CommandLine,
}

pub struct StreamRegistry {
    fabric: LinkFabric,
    streams: Vec<Stream>,
    source: ConfigSource,
}

impl StreamRegistry {
    /// Creates `max_streams` unconfigured streams sharing one fabric.
    pub fn new(max_streams: usize) -> StreamRegistry {
        let fabric = LinkFabric::new(max_streams);
        let streams = (0..max_streams)
            .map(|id| Stream::new(id, fabric.clone()))
            .collect();
        StreamRegistry {
            fabric,
            streams,
            source: ConfigSource::Default,
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn source(&self) -> ConfigSource {
        self.source
    }

    pub fn fabric(&self) -> &LinkFabric {
        &self.fabric
    }

    pub fn stream(&self, id: usize) -> Option<&Stream> {
        self.streams.get(id)
    }

    pub fn stream_mut(&mut self, id: usize) -> Option<&mut Stream> {
        self.streams.get_mut(id)
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter()
    }

    fn apply_port(&mut self, config: &PortConfig) -> Result<()> {
        let len = self.streams.len();
        let stream = self.streams.get_mut(config.id).ok_or_else(|| {
            Error::Config(format!(
                "stream {} out of range (only {} streams)",
                config.id, len
            ))
        })?;
        stream.apply_config(config)
    }

    /// Applies every port of a configuration file. A bad port is logged and
    /// skipped. Returns how many ports were applied.
    pub fn apply_file_configuration(&mut self, config: &RouterConfig) -> usize {
        self.source = ConfigSource::File;
        let mut applied = 0;
        for port in &config.ports {
            match self.apply_port(port) {
                Ok(()) => applied += 1,
                Err(e) => error!("Skipping stream {} from configuration: {}", port.id, e),
            }
        }
        info!("Applied {} of {} configured streams.", applied, config.ports.len());
        applied
    }

    /// Applies one `<kind>://<params>[#links]` line per stream, in id order.
    /// Stops at the first bad line.
    pub fn apply_command_line_configuration<S: AsRef<str>>(&mut self, lines: &[S]) -> Result<()> {
        self.source = ConfigSource::CommandLine;
        if lines.len() > self.streams.len() {
            return Err(Error::Config(format!(
                "{} streams given but only {} available",
                lines.len(),
                self.streams.len()
            )));
        }
        for (id, line) in lines.iter().enumerate() {
            let config = parse_stream_line(id, line.as_ref(), self.streams.len())?;
            self.apply_port(&config)?;
        }
        Ok(())
    }

    /// Connects every stream flagged for startup. Failures are logged and
    /// the remaining streams still get their turn. Returns how many connected.
    pub async fn connect_all_marked_for_startup(&mut self) -> usize {
        let mut connected = 0;
        for stream in self.streams.iter_mut() {
            if !stream.connect_on_startup() || stream.settings().is_none() {
                continue;
            }
            match stream.connect().await {
                Ok(()) => connected += 1,
                Err(e) => warn!("Stream {} did not connect at startup: {}", stream.id(), e),
            }
        }
        connected
    }

    /// Current configuration of every stream.
    pub fn snapshot(&self) -> RouterConfig {
        RouterConfig {
            max_streams: self.streams.len(),
            ports: self.streams.iter().map(Stream::to_config).collect(),
        }
    }

    /// Disconnects every stream. For file and default configurations the
    /// state to persist is returned; command-line setups are not saved.
    pub async fn close_all(&mut self) -> Option<RouterConfig> {
        let snapshot = match self.source {
            ConfigSource::File | ConfigSource::Default => Some(self.snapshot()),
            ConfigSource::CommandLine => None,
        };
        for stream in self.streams.iter_mut() {
            if let Err(e) = stream.disconnect().await {
                warn!("{}", e);
            }
        }
        snapshot
    }
}
