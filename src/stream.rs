//! A stream is one configured endpoint of the router: its transport
//! settings, the links to other streams, the observability switches and the
//! lifecycle of its worker task.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{PortConfig, DEFAULT_LINE_TERMINATION};
use crate::error::{Error, Result};
use crate::fabric::{InboxReceiver, LinkFabric};
use crate::ntrip::{NtripClient, SourceTableEntry};
use crate::transport::{Transport, TransportKind, TransportSettings};
use crate::worker::{self, ShowData, StreamStatus, TrafficLog, Visibility, WorkerContext};

/// How long `disconnect` waits for the worker before aborting it.
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Control-side handles of a running worker.
struct WorkerHandle {
    task: JoinHandle<Result<()>>,
    stop: watch::Sender<bool>,
    link_updates: UnboundedSender<usize>,
}

/// Reads a script file into lines ready to be queued.
async fn read_script(path: &Path, line_termination: &str) -> Result<Vec<Bytes>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| Error::ScriptFile {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| Bytes::from(format!("{}{}", line, line_termination)))
        .collect())
}

pub struct Stream {
    id: usize,
    settings: Option<TransportSettings>,
    linked_ids: BTreeSet<usize>,
    fabric: LinkFabric,
    visibility: Arc<Visibility>,
    status: Arc<watch::Sender<StreamStatus>>,
    show_tx: UnboundedSender<ShowData>,
    show_rx: UnboundedReceiver<ShowData>,
    logging: bool,
    log_file: PathBuf,
    startup_script_enabled: bool,
    startup_script: PathBuf,
    shutdown_script_enabled: bool,
    shutdown_script: PathBuf,
    line_termination: String,
    connect_on_startup: bool,
    local_addr: Option<SocketAddr>,
    worker: Option<WorkerHandle>,
}

impl Stream {
    /// Creates an unconfigured stream bound to inbox `id` of the fabric.
    pub fn new(id: usize, fabric: LinkFabric) -> Stream {
        let (status, _) = watch::channel(StreamStatus::default());
        let (show_tx, show_rx) = mpsc::unbounded_channel();
        Stream {
            id,
            settings: None,
            linked_ids: BTreeSet::new(),
            fabric,
            visibility: Arc::new(Visibility::default()),
            status: Arc::new(status),
            show_tx,
            show_rx,
            logging: false,
            log_file: PathBuf::new(),
            startup_script_enabled: false,
            startup_script: PathBuf::new(),
            shutdown_script_enabled: false,
            shutdown_script: PathBuf::new(),
            line_termination: DEFAULT_LINE_TERMINATION.to_string(),
            connect_on_startup: false,
            local_addr: None,
            worker: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn settings(&self) -> Option<&TransportSettings> {
        self.settings.as_ref()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.settings
            .as_ref()
            .map(TransportSettings::kind)
            .unwrap_or_default()
    }

    pub fn linked_ids(&self) -> &BTreeSet<usize> {
        &self.linked_ids
    }

    pub fn input_rate(&self) -> f64 {
        self.status.borrow().input_kbps
    }

    pub fn output_rate(&self) -> f64 {
        self.status.borrow().output_kbps
    }

    /// Most recent worker fault.
    pub fn last_error(&self) -> Option<String> {
        self.status.borrow().last_error.clone()
    }

    /// Watch rates and faults as the worker publishes them.
    pub fn subscribe_status(&self) -> watch::Receiver<StreamStatus> {
        self.status.subscribe()
    }

    pub fn shows_incoming(&self) -> bool {
        self.visibility.incoming()
    }

    pub fn shows_outgoing(&self) -> bool {
        self.visibility.outgoing()
    }

    pub fn logging(&self) -> bool {
        self.logging
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn line_termination(&self) -> &str {
        &self.line_termination
    }

    pub fn connect_on_startup(&self) -> bool {
        self.connect_on_startup
    }

    /// Bound address of a listening TCP server or UDP socket while connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Human-readable description of the active transport.
    pub fn settings_summary(&self) -> String {
        match &self.settings {
            Some(settings) => settings.to_string(),
            None => "Not configured".to_string(),
        }
    }

    /// Whether a worker is alive. A worker that stopped on a fault counts as
    /// disconnected even though `disconnect` was never called.
    pub fn is_connected(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |worker| !worker.task.is_finished())
    }

    fn ensure_disconnected(&self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::Settings(format!(
                "stream {} must be disconnected to change its settings",
                self.id
            )));
        }
        Ok(())
    }

    pub fn set_transport(&mut self, settings: Option<TransportSettings>) -> Result<()> {
        self.ensure_disconnected()?;
        self.settings = settings;
        Ok(())
    }

    pub fn set_logging(&mut self, enabled: bool, path: impl Into<PathBuf>) -> Result<()> {
        self.ensure_disconnected()?;
        self.logging = enabled;
        self.log_file = path.into();
        Ok(())
    }

    pub fn set_startup_script(&mut self, enabled: bool, path: impl Into<PathBuf>) -> Result<()> {
        self.ensure_disconnected()?;
        self.startup_script_enabled = enabled;
        self.startup_script = path.into();
        Ok(())
    }

    pub fn set_shutdown_script(&mut self, enabled: bool, path: impl Into<PathBuf>) -> Result<()> {
        self.ensure_disconnected()?;
        self.shutdown_script_enabled = enabled;
        self.shutdown_script = path.into();
        Ok(())
    }

    pub fn set_line_termination(&mut self, termination: &str) -> Result<()> {
        self.ensure_disconnected()?;
        self.line_termination = termination.to_string();
        Ok(())
    }

    pub fn set_connect_on_startup(&mut self, enabled: bool) {
        self.connect_on_startup = enabled;
    }

    /// Queues `text` for transmission on this stream's transport.
    pub fn send_command(&self, text: &str) {
        self.fabric.send(self.id, Bytes::from(text.to_owned()));
    }

    pub fn toggle_incoming_visibility(&self) -> bool {
        self.visibility.toggle_incoming()
    }

    pub fn toggle_outgoing_visibility(&self) -> bool {
        self.visibility.toggle_outgoing()
    }

    /// Everything the worker mirrored since the last call.
    pub fn drain_show_data(&mut self) -> Vec<ShowData> {
        let mut shown = Vec::new();
        while let Ok(data) = self.show_rx.try_recv() {
            shown.push(data);
        }
        shown
    }

    /// Toggles forwarding of this stream's incoming data to stream `other`.
    /// A running worker picks the change up without a restart.
    pub fn update_link(&mut self, other: usize) -> Result<()> {
        if other == self.id {
            return Err(Error::Settings(format!(
                "stream {} cannot link to itself",
                self.id
            )));
        }
        if other >= self.fabric.len() {
            return Err(Error::Settings(format!("no stream with id {}", other)));
        }
        worker::toggle_link(&mut self.linked_ids, self.id, other);
        if self.is_connected() {
            if let Some(worker) = &self.worker {
                let _ = worker.link_updates.send(other);
            }
        }
        debug!("Stream {} links: {:?}", self.id, self.linked_ids);
        Ok(())
    }

    /// Retrieves the caster source table of an NTRIP stream without
    /// connecting it, and keeps it in the settings.
    pub async fn get_source_table(&mut self) -> Result<Vec<SourceTableEntry>> {
        let settings = match &mut self.settings {
            Some(TransportSettings::Ntrip(settings)) => settings,
            _ => {
                return Err(Error::Settings(format!(
                    "stream {} is not an NTRIP stream",
                    self.id
                )))
            }
        };
        let mut client = NtripClient::new(settings.clone());
        let table = client.get_source_table().await?;
        settings.source_table = table.clone();
        Ok(table)
    }

    /// Opens the transport and starts the worker. Calling it on a connected
    /// stream only logs an error.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            error!("Stream {} is already connected.", self.id);
            return Ok(());
        }
        // Reap a worker that ended on a fault
        if let Some(old) = self.worker.take() {
            let _ = old.task.await;
        }

        let settings = self
            .settings
            .as_ref()
            .ok_or_else(|| Error::MissingSettings(format!("stream {} has no transport", self.id)))?;
        settings.validate()?;
        let transport = settings
            .connect()
            .await
            .map_err(|e| Error::OpenConnection {
                id: self.id,
                source: Box::new(e),
            })?;
        let local_addr = transport.local_addr();

        match self.start_worker(transport).await {
            Ok(handle) => {
                self.worker = Some(handle);
                self.local_addr = local_addr;
                self.status.send_modify(|status| status.last_error = None);
                info!("Stream {} connected: {}", self.id, self.settings_summary());
                Ok(())
            }
            Err(e) => {
                self.worker = None;
                Err(Error::StreamThread(format!("stream {}: {}", self.id, e)))
            }
        }
    }

    async fn start_worker(&mut self, transport: Transport) -> Result<WorkerHandle> {
        let prepared = self.prepare_worker().await;
        let (inbox, log) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(close_error) = transport.close().await {
                    debug!("Stream {}: {}", self.id, close_error);
                }
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        for &target in &self.linked_ids {
            let _ = link_tx.send(target);
        }

        let ctx = WorkerContext {
            id: self.id,
            transport,
            fabric: self.fabric.clone(),
            inbox,
            link_updates: link_rx,
            show_tx: self.show_tx.clone(),
            visibility: self.visibility.clone(),
            status: self.status.clone(),
            stop: stop_rx,
            log,
        };
        let task = tokio::spawn(worker::run(ctx));

        Ok(WorkerHandle {
            task,
            stop: stop_tx,
            link_updates: link_tx,
        })
    }

    /// Claims and empties the inbox, opens the log and queues the startup
    /// script ahead of anything the worker will see.
    async fn prepare_worker(&mut self) -> Result<(InboxReceiver, Option<TrafficLog>)> {
        let mut inbox = self
            .fabric
            .lock_inbox(self.id)
            .await
            .ok_or_else(|| Error::StreamThread(format!("no inbox for stream {}", self.id)))?;
        while inbox.try_recv().is_ok() {}

        let log = if self.logging {
            Some(TrafficLog::open(&self.log_file).await?)
        } else {
            None
        };

        if self.startup_script_enabled {
            for line in read_script(&self.startup_script, &self.line_termination).await? {
                self.fabric.send(self.id, line);
            }
        }
        Ok((inbox, log))
    }

    /// Stops the worker and closes the transport. The stream ends up
    /// disconnected even when closing reports an error.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let WorkerHandle {
            mut task, stop, ..
        } = worker;

        if self.shutdown_script_enabled && !task.is_finished() {
            match read_script(&self.shutdown_script, &self.line_termination).await {
                Ok(lines) => {
                    for line in lines {
                        self.fabric.send(self.id, line);
                    }
                }
                Err(e) => warn!("Stream {}: {}", self.id, e),
            }
        }

        let _ = stop.send(true);
        let result = match timeout(WORKER_JOIN_TIMEOUT, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(Error::Closing(reason)))) => Err(Error::Disconnect {
                id: self.id,
                reason,
            }),
            // A fault already ended the worker and was published then
            Ok(Ok(Err(_))) => Ok(()),
            Ok(Err(join_error)) => Err(Error::Disconnect {
                id: self.id,
                reason: join_error.to_string(),
            }),
            Err(_) => {
                warn!(
                    "Stream {} worker did not stop within {:?}, aborting it.",
                    self.id, WORKER_JOIN_TIMEOUT
                );
                task.abort();
                let _ = task.await;
                Ok(())
            }
        };

        self.local_addr = None;
        self.status.send_modify(|status| {
            status.input_kbps = 0.0;
            status.output_kbps = 0.0;
        });
        info!("Stream {} disconnected.", self.id);
        result
    }

    /// Snapshot of this stream for persistence.
    pub fn to_config(&self) -> PortConfig {
        PortConfig {
            id: self.id,
            linked_ports: self.linked_ids.iter().copied().collect(),
            transport: self.settings.clone(),
            startup_script_enabled: self.startup_script_enabled,
            startup_script: self.startup_script.clone(),
            shutdown_script_enabled: self.shutdown_script_enabled,
            shutdown_script: self.shutdown_script.clone(),
            logging: self.logging,
            log_file: self.log_file.clone(),
            show_incoming: self.visibility.incoming(),
            show_outgoing: self.visibility.outgoing(),
            line_termination: self.line_termination.clone(),
            connect_on_startup: self.connect_on_startup,
        }
    }

    /// Replaces this stream's configuration. Nothing changes unless the
    /// whole configuration is acceptable.
    pub fn apply_config(&mut self, config: &PortConfig) -> Result<()> {
        self.ensure_disconnected()?;
        let mut links = BTreeSet::new();
        for &target in &config.linked_ports {
            if target == self.id || target >= self.fabric.len() {
                return Err(Error::Config(format!(
                    "stream {} cannot link to stream {}",
                    self.id, target
                )));
            }
            links.insert(target);
        }

        self.settings = config.transport.clone();
        self.linked_ids = links;
        self.startup_script_enabled = config.startup_script_enabled;
        self.startup_script = config.startup_script.clone();
        self.shutdown_script_enabled = config.shutdown_script_enabled;
        self.shutdown_script = config.shutdown_script.clone();
        self.logging = config.logging;
        self.log_file = config.log_file.clone();
        self.visibility.set_incoming(config.show_incoming);
        self.visibility.set_outgoing(config.show_outgoing);
        self.line_termination = config.line_termination.clone();
        self.connect_on_startup = config.connect_on_startup;
        Ok(())
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, self.settings_summary())?;
        if !self.linked_ids.is_empty() {
            write!(f, " -> {:?}", self.linked_ids)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("linked_ids", &self.linked_ids)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TcpSettings;

    fn stream(id: usize) -> Stream {
        Stream::new(id, LinkFabric::new(4))
    }

    #[test]
    fn test_update_link_twice_restores_links() {
        let mut s = stream(0);
        s.update_link(2).unwrap();
        s.update_link(3).unwrap();
        s.update_link(2).unwrap();
        assert_eq!(s.linked_ids(), &BTreeSet::from([3]));
        s.update_link(3).unwrap();
        assert!(s.linked_ids().is_empty());
    }

    #[test]
    fn test_update_link_rejects_self_and_unknown() {
        let mut s = stream(1);
        assert!(matches!(s.update_link(1), Err(Error::Settings(_))));
        assert!(matches!(s.update_link(4), Err(Error::Settings(_))));
        assert!(s.linked_ids().is_empty());
    }

    #[tokio::test]
    async fn test_connect_without_transport() {
        let mut s = stream(0);
        assert!(matches!(s.connect().await, Err(Error::MissingSettings(_))));
        assert!(!s.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_is_open_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut s = stream(0);
        s.set_transport(Some(TransportSettings::Tcp(TcpSettings::client("127.0.0.1", port))))
            .unwrap();
        let err = s.connect().await.unwrap_err();
        assert!(matches!(err, Error::OpenConnection { id: 0, .. }));
        assert!(!s.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected_is_noop() {
        let mut s = stream(0);
        s.disconnect().await.unwrap();
        assert!(!s.is_connected());
    }

    #[test]
    fn test_send_command_queues_on_own_inbox() {
        let fabric = LinkFabric::new(2);
        let s = Stream::new(1, fabric.clone());
        s.send_command("$PMTK220,1000*1F\r\n");
        assert_eq!(fabric.try_drain(1), vec![Bytes::from_static(b"$PMTK220,1000*1F\r\n")]);
        assert!(fabric.try_drain(0).is_empty());
    }

    #[test]
    fn test_config_round_trip() {
        let mut s = stream(2);
        s.set_transport(Some(TransportSettings::Tcp(TcpSettings::server(5000))))
            .unwrap();
        s.update_link(0).unwrap();
        s.set_logging(true, "/tmp/stream2.log").unwrap();
        s.toggle_outgoing_visibility();

        let config = s.to_config();
        let mut copy = stream(2);
        copy.apply_config(&config).unwrap();
        assert_eq!(copy.to_config(), config);
        assert!(copy.shows_outgoing());
        assert_eq!(copy.settings_summary(), "TCP server on port 5000");
    }

    #[test]
    fn test_apply_config_is_all_or_nothing() {
        let mut s = stream(0);
        let mut config = PortConfig::new(0);
        config.logging = true;
        config.linked_ports = vec![1, 0];
        assert!(matches!(s.apply_config(&config), Err(Error::Config(_))));
        assert!(!s.logging());
        assert!(s.linked_ids().is_empty());
    }
}
