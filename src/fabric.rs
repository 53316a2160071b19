//! The link fabric: one inbox per stream, index-aligned with stream ids.
//!
//! Any worker may push into any inbox. The receiving half of inbox `i` is
//! locked by stream `i`'s worker for as long as it runs, so only that worker
//! ever dequeues it.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive access to one inbox's receiving half.
pub type InboxReceiver = OwnedMutexGuard<UnboundedReceiver<Bytes>>;

struct Inbox {
    tx: UnboundedSender<Bytes>,
    rx: Arc<Mutex<UnboundedReceiver<Bytes>>>,
}

/// Shared array of per-stream inboxes. Cloning is cheap.
#[derive(Clone)]
pub struct LinkFabric {
    inboxes: Arc<Vec<Inbox>>,
}

impl LinkFabric {
    pub fn new(max_streams: usize) -> LinkFabric {
        let inboxes = (0..max_streams)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                Inbox {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                }
            })
            .collect();
        LinkFabric {
            inboxes: Arc::new(inboxes),
        }
    }

    pub fn len(&self) -> usize {
        self.inboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inboxes.is_empty()
    }

    /// Queues `data` for transmission by stream `id`. Returns false for an
    /// unknown id.
    pub fn send(&self, id: usize, data: Bytes) -> bool {
        match self.inboxes.get(id) {
            // The receiver lives as long as the fabric, so this cannot fail.
            Some(inbox) => inbox.tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Takes the receiving half of inbox `id`, waiting for a previous
    /// holder to release it.
    pub async fn lock_inbox(&self, id: usize) -> Option<InboxReceiver> {
        let inbox = self.inboxes.get(id)?;
        Some(inbox.rx.clone().lock_owned().await)
    }

    /// Removes everything waiting in inbox `id` when no worker holds it.
    pub fn try_drain(&self, id: usize) -> Vec<Bytes> {
        let mut drained = Vec::new();
        if let Some(inbox) = self.inboxes.get(id) {
            if let Ok(mut rx) = inbox.rx.try_lock() {
                while let Ok(data) = rx.try_recv() {
                    drained.push(data);
                }
            }
        }
        drained
    }
}
