//! Change-notification primitive: listening connections that receive a
//! signal whenever a publish commits.

use crate::error::{Result, StoreError};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// "Rows were inserted." Carries no payload; listeners re-read from their own cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Notification;

/// A dedicated connection receiving notifications.
pub trait ListenConnection: Send {
    /// Notifications posted to this connection. Disconnects when the
    /// connection is terminated.
    fn notifications(&self) -> &Receiver<Notification>;

    /// Liveness probe.
    fn probe(&self) -> Result<()>;

    /// Close the connection. Errors are ignored.
    fn close(self: Box<Self>);
}

/// Something that can open listening connections.
pub trait NotificationSource: Send + Sync {
    fn listen(&self) -> Result<Box<dyn ListenConnection>>;
}

/// Registered listening connections of one database.
pub(crate) struct ListenerTable {
    open: AtomicBool,
    next_id: AtomicU64,
    senders: Mutex<HashMap<u64, Sender<Notification>>>,
}

impl ListenerTable {
    pub(crate) fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn listen(self: &Arc<Self>) -> Result<Box<dyn ListenConnection>> {
        if !self.open.load(Ordering::Acquire) {
            return Err(StoreError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Capacity 1: a pending notification already covers any later ones.
        let (sender, receiver) = bounded(1);
        self.senders.lock().insert(id, sender);
        tracing::debug!(listener = id, "listening connection opened");

        Ok(Box::new(DbListener {
            id,
            table: Arc::clone(self),
            receiver,
        }))
    }

    /// Post a notification to every connection.
    pub(crate) fn notify_all(&self) {
        let mut senders = self.senders.lock();
        senders.retain(|id, sender| match sender.try_send(Notification) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!(listener = *id, "dropping disconnected listener");
                false
            }
        });
    }

    /// Drop every connection, as a backend restart would.
    pub(crate) fn terminate_all(&self) -> usize {
        let mut senders = self.senders.lock();
        let count = senders.len();
        senders.clear();
        count
    }

    pub(crate) fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
        self.terminate_all();
    }

    pub(crate) fn count(&self) -> usize {
        self.senders.lock().len()
    }
}

struct DbListener {
    id: u64,
    table: Arc<ListenerTable>,
    receiver: Receiver<Notification>,
}

impl ListenConnection for DbListener {
    fn notifications(&self) -> &Receiver<Notification> {
        &self.receiver
    }

    fn probe(&self) -> Result<()> {
        if self.table.open.load(Ordering::Acquire) && self.table.senders.lock().contains_key(&self.id)
        {
            Ok(())
        } else {
            Err(StoreError::ConnectionClosed)
        }
    }

    fn close(self: Box<Self>) {
        self.table.senders.lock().remove(&self.id);
    }
}
