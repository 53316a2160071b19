//! The per-stream worker task.
//!
//! One worker runs per connected stream. It owns the live transport and the
//! receiving half of its stream's inbox, forwards every incoming chunk to the
//! inboxes of the linked streams, writes its own inbox to the transport and
//! applies link toggles sent by the control side.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::fabric::{InboxReceiver, LinkFabric};
use crate::transport::Transport;

/// Window over which throughput is measured.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Observable state of a stream, published by its worker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamStatus {
    pub input_kbps: f64,
    pub output_kbps: f64,
    /// Fault that stopped the most recent worker, if any.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Traffic copied out for a front-end to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowData {
    pub stream_id: usize,
    pub direction: Direction,
    pub text: String,
}

/// Which traffic directions are mirrored to the show queue and log.
#[derive(Debug, Default)]
pub struct Visibility {
    incoming: AtomicBool,
    outgoing: AtomicBool,
}

impl Visibility {
    pub fn incoming(&self) -> bool {
        self.incoming.load(Ordering::Relaxed)
    }

    pub fn outgoing(&self) -> bool {
        self.outgoing.load(Ordering::Relaxed)
    }

    pub fn set_incoming(&self, show: bool) {
        self.incoming.store(show, Ordering::Relaxed);
    }

    pub fn set_outgoing(&self, show: bool) {
        self.outgoing.store(show, Ordering::Relaxed);
    }

    /// Flips and returns the new value.
    pub fn toggle_incoming(&self) -> bool {
        !self.incoming.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn toggle_outgoing(&self) -> bool {
        !self.outgoing.fetch_xor(true, Ordering::Relaxed)
    }
}

/// Byte counters for the current rate window.
#[derive(Debug, Default)]
pub struct Throughput {
    input: u64,
    output: u64,
}

fn kilobytes(bytes: u64) -> f64 {
    (bytes as f64 / 1000.0 * 10.0).round() / 10.0
}

impl Throughput {
    pub fn add_input(&mut self, bytes: usize) {
        self.input += bytes as u64;
    }

    pub fn add_output(&mut self, bytes: usize) {
        self.output += bytes as u64;
    }

    /// Closes the window: returns (input, output) in kB rounded to one
    /// decimal and starts counting from zero.
    pub fn roll(&mut self) -> (f64, f64) {
        let rates = (kilobytes(self.input), kilobytes(self.output));
        self.input = 0;
        self.output = 0;
        rates
    }
}

/// Append-only traffic log of one stream.
pub struct TrafficLog {
    path: PathBuf,
    file: File,
}

impl TrafficLog {
    pub async fn open(path: &Path) -> Result<TrafficLog> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| Error::LogFile {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(TrafficLog {
            path: path.to_path_buf(),
            file,
        })
    }

    pub async fn append(&mut self, direction: Direction, text: &str) -> Result<()> {
        let marker = match direction {
            Direction::Incoming => "<<",
            Direction::Outgoing => ">>",
        };
        let line = format!(
            "{} {} {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            marker,
            text.trim_end()
        );
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|source| Error::LogFile {
                path: self.path.clone(),
                source,
            })
    }
}

/// Toggles `id` in a forwarding set. A stream never forwards to itself.
pub fn toggle_link(links: &mut BTreeSet<usize>, own_id: usize, id: usize) {
    if id == own_id {
        return;
    }
    if !links.remove(&id) {
        links.insert(id);
    }
}

/// Everything a worker needs, handed over when the stream connects.
pub struct WorkerContext {
    pub id: usize,
    pub transport: Transport,
    pub fabric: LinkFabric,
    pub inbox: InboxReceiver,
    pub link_updates: UnboundedReceiver<usize>,
    pub show_tx: UnboundedSender<ShowData>,
    pub visibility: Arc<Visibility>,
    pub status: Arc<watch::Sender<StreamStatus>>,
    pub stop: watch::Receiver<bool>,
    pub log: Option<TrafficLog>,
}

enum Event {
    Stop,
    Tick,
    LinkToggle(usize),
    Outgoing(Bytes),
    Received(Result<Option<Bytes>>),
}

struct Worker {
    id: usize,
    fabric: LinkFabric,
    show_tx: UnboundedSender<ShowData>,
    visibility: Arc<Visibility>,
    status: Arc<watch::Sender<StreamStatus>>,
    log: Option<TrafficLog>,
    links: BTreeSet<usize>,
    throughput: Throughput,
}

impl Worker {
    async fn mirror(&mut self, direction: Direction, data: &[u8]) {
        let text = String::from_utf8_lossy(data).into_owned();
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.append(direction, &text).await {
                warn!("Stream {}: {}", self.id, e);
            }
        }
        let _ = self.show_tx.send(ShowData {
            stream_id: self.id,
            direction,
            text,
        });
    }

    async fn incoming(&mut self, data: Bytes) {
        self.throughput.add_input(data.len());
        if self.visibility.incoming() {
            self.mirror(Direction::Incoming, &data).await;
        }
        for &target in &self.links {
            self.fabric.send(target, data.clone());
        }
    }

    async fn outgoing(&mut self, transport: &mut Transport, data: Bytes) -> Result<()> {
        let written = transport.write(&data).await?;
        self.throughput.add_output(written);
        if self.visibility.outgoing() {
            self.mirror(Direction::Outgoing, &data).await;
        }
        Ok(())
    }

    fn publish_rates(&mut self) {
        let (input, output) = self.throughput.roll();
        self.status.send_modify(|status| {
            status.input_kbps = input;
            status.output_kbps = output;
        });
    }

    fn zero_rates(&self, fault: Option<String>) {
        self.status.send_modify(|status| {
            status.input_kbps = 0.0;
            status.output_kbps = 0.0;
            if fault.is_some() {
                status.last_error = fault;
            }
        });
    }
}

/// Runs until the stop signal is raised or the transport fails.
///
/// On a clean stop whatever is still queued (the shutdown script) is written
/// once more before the transport is closed. On a fault the transport is
/// closed, the rates are zeroed and the fault is published as `last_error`.
pub async fn run(ctx: WorkerContext) -> Result<()> {
    let WorkerContext {
        id,
        mut transport,
        fabric,
        mut inbox,
        mut link_updates,
        show_tx,
        visibility,
        status,
        mut stop,
        log,
    } = ctx;

    let mut worker = Worker {
        id,
        fabric,
        show_tx,
        visibility,
        status,
        log,
        links: BTreeSet::new(),
        throughput: Throughput::default(),
    };
    let mut ticker = interval_at(Instant::now() + RATE_WINDOW, RATE_WINDOW);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Stream {} worker started.", id);
    let fault = loop {
        if *stop.borrow() {
            break None;
        }
        let event = tokio::select! {
            biased;
            changed = stop.changed() => match changed {
                Ok(()) => Event::Stop,
                // Control side is gone
                Err(_) => Event::Stop,
            },
            _ = ticker.tick() => Event::Tick,
            Some(target) = link_updates.recv() => Event::LinkToggle(target),
            Some(data) = inbox.recv() => Event::Outgoing(data),
            received = transport.read() => Event::Received(received),
        };

        match event {
            Event::Stop => break None,
            Event::Tick => worker.publish_rates(),
            Event::LinkToggle(target) => {
                toggle_link(&mut worker.links, id, target);
                debug!("Stream {} now forwards to {:?}.", id, worker.links);
            }
            Event::Outgoing(data) => {
                let mut next = Some(data);
                let mut failure = None;
                while let Some(data) = next {
                    if let Err(e) = worker.outgoing(&mut transport, data).await {
                        failure = Some(e);
                        break;
                    }
                    next = inbox.try_recv().ok();
                }
                if let Some(e) = failure {
                    break Some(e);
                }
            }
            Event::Received(Ok(Some(data))) => worker.incoming(data).await,
            Event::Received(Ok(None)) => {}
            Event::Received(Err(e)) => break Some(e),
        }
    };

    match fault {
        None => {
            while let Ok(data) = inbox.try_recv() {
                if let Err(e) = worker.outgoing(&mut transport, data).await {
                    warn!("Stream {}: could not send queued data on stop: {}", id, e);
                    break;
                }
            }
            worker.zero_rates(None);
            info!("Stream {} worker stopped.", id);
            transport.close().await
        }
        Some(e) => {
            error!("Stream {} fault, disconnecting: {}", id, e);
            worker.zero_rates(Some(e.to_string()));
            if let Err(close_error) = transport.close().await {
                debug!("Stream {}: {}", id, close_error);
            }
            Err(Error::StreamThread(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_of_five_thousand_bytes() {
        let mut throughput = Throughput::default();
        throughput.add_input(2000);
        throughput.add_input(3000);
        throughput.add_output(1234);
        assert_eq!(throughput.roll(), (5.0, 1.2));
        assert_eq!(throughput.roll(), (0.0, 0.0));
    }

    #[test]
    fn test_toggle_link_twice_restores_set() {
        let mut links = BTreeSet::from([2]);
        toggle_link(&mut links, 0, 1);
        assert_eq!(links, BTreeSet::from([1, 2]));
        toggle_link(&mut links, 0, 1);
        assert_eq!(links, BTreeSet::from([2]));
    }

    #[test]
    fn test_never_links_to_itself() {
        let mut links = BTreeSet::new();
        toggle_link(&mut links, 3, 3);
        assert!(links.is_empty());
    }

    #[test]
    fn test_visibility_toggles() {
        let visibility = Visibility::default();
        assert!(visibility.toggle_incoming());
        assert!(visibility.incoming());
        assert!(!visibility.toggle_incoming());
        assert!(!visibility.outgoing());
        assert!(visibility.toggle_outgoing());
    }
}
