//! Wake-up bell fanning backend insert notifications out to subscriptions.

use super::engine::SubscriptionId;
use super::trigger::DebouncedTrigger;
use crate::db::{ListenConnection, NotificationSource};
use crate::error::Result;
use crossbeam_channel::{bounded, select, tick, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Registry = Mutex<HashMap<SubscriptionId, DebouncedTrigger>>;

/// Notifier settings.
#[derive(Clone, Debug)]
pub struct NotifierConfig {
    /// Interval between liveness probes of the listening connection.
    pub probe_interval: Duration,
    /// Wait between failed reconnect attempts.
    pub reconnect_backoff: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

/// Owns the one listening connection and the registry of triggers.
///
/// Every notification triggers every registered trigger. Notifications carry
/// no payload; each subscription re-reads from its own cursor.
pub struct ChangeNotifier {
    registry: Arc<Registry>,
    reconnects: Arc<AtomicU64>,
    shutdown: Sender<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeNotifier {
    /// Open the listening connection and start the listener thread.
    pub fn start(source: Arc<dyn NotificationSource>, config: NotifierConfig) -> Result<Self> {
        let conn = source.listen()?;
        let registry: Arc<Registry> = Arc::new(Mutex::new(HashMap::new()));
        let reconnects = Arc::new(AtomicU64::new(0));
        let (shutdown, shutdown_rx) = bounded(1);

        let listener = Listener {
            source,
            config,
            registry: Arc::clone(&registry),
            reconnects: Arc::clone(&reconnects),
            shutdown: shutdown_rx,
        };
        let handle = thread::Builder::new()
            .name("factstore-notifier".into())
            .spawn(move || listener.run(conn))?;

        Ok(Self {
            registry,
            reconnects,
            shutdown,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn register(&self, id: SubscriptionId, trigger: DebouncedTrigger) {
        self.registry.lock().insert(id, trigger);
        tracing::debug!(subscription = %id, "trigger registered");
    }

    pub fn unregister(&self, id: SubscriptionId) -> Option<DebouncedTrigger> {
        let removed = self.registry.lock().remove(&id);
        if removed.is_some() {
            tracing::debug!(subscription = %id, "trigger unregistered");
        }
        removed
    }

    pub fn registered(&self) -> usize {
        self.registry.lock().len()
    }

    /// Successful reconnects since start.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Trigger every registered subscription.
    pub fn fire_all(&self) {
        fire_all(&self.registry);
    }

    /// Stop the listener thread and close its connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("notifier thread panicked");
            }
        }
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Triggers are cloned out so none runs under the registry lock.
fn fire_all(registry: &Registry) {
    let triggers: Vec<DebouncedTrigger> = registry.lock().values().cloned().collect();
    for trigger in triggers {
        trigger.trigger();
    }
}

struct Listener {
    source: Arc<dyn NotificationSource>,
    config: NotifierConfig,
    registry: Arc<Registry>,
    reconnects: Arc<AtomicU64>,
    shutdown: Receiver<()>,
}

impl Listener {
    fn run(self, mut conn: Box<dyn ListenConnection>) {
        tracing::debug!("notifier listening");
        let probe = tick(self.config.probe_interval);

        loop {
            let notifications = conn.notifications().clone();
            select! {
                recv(notifications) -> msg => match msg {
                    Ok(_) => fire_all(&self.registry),
                    Err(_) => {
                        tracing::warn!("listening connection dropped, reconnecting");
                        conn = match self.reconnect(conn) {
                            Some(conn) => conn,
                            None => return,
                        };
                    }
                },
                recv(probe) -> _ => {
                    if let Err(e) = conn.probe() {
                        tracing::warn!(error = %e, "liveness probe failed, reconnecting");
                        conn = match self.reconnect(conn) {
                            Some(conn) => conn,
                            None => return,
                        };
                    }
                },
                recv(self.shutdown) -> _ => break,
            }
        }

        conn.close();
        tracing::debug!("notifier stopped");
    }

    /// Replace a stale connection. Returns `None` on shutdown.
    fn reconnect(&self, stale: Box<dyn ListenConnection>) -> Option<Box<dyn ListenConnection>> {
        stale.close();
        loop {
            match self.source.listen() {
                Ok(conn) => {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("listening connection re-established");
                    // Inserts during the outage produced no notification.
                    fire_all(&self.registry);
                    return Some(conn);
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff = ?self.config.reconnect_backoff, "reconnect failed");
                    match self.shutdown.recv_timeout(self.config.reconnect_backoff) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return None,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::subscription::timer::TimerPool;
    use crate::types::Fact;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tempfile::TempDir;

    fn counting_trigger(timers: &Arc<TimerPool>) -> (DebouncedTrigger, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let trigger = DebouncedTrigger::new(
            Duration::ZERO,
            Arc::clone(timers),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            || true,
        );
        (trigger, runs)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn setup() -> (TempDir, Arc<Database>, Arc<TimerPool>) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(dir.path().join("facts.log"), 1, 16).unwrap());
        (dir, db, Arc::new(TimerPool::new(1).unwrap()))
    }

    #[test]
    fn test_publish_fires_registered_triggers() {
        let (_dir, db, timers) = setup();
        let notifier = ChangeNotifier::start(db.clone(), NotifierConfig::default()).unwrap();
        let (trigger, runs) = counting_trigger(&timers);
        notifier.register(SubscriptionId(1), trigger);
        assert_eq!(notifier.registered(), 1);

        db.publish(vec![Fact::new("ns", json!(1))]).unwrap();
        assert!(wait_for(|| runs.load(Ordering::SeqCst) >= 1));

        notifier.unregister(SubscriptionId(1));
        let before = runs.load(Ordering::SeqCst);
        db.publish(vec![Fact::new("ns", json!(2))]).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_reconnects_after_connection_loss() {
        let (_dir, db, timers) = setup();
        let config = NotifierConfig {
            probe_interval: Duration::from_millis(20),
            reconnect_backoff: Duration::from_millis(10),
        };
        let notifier = ChangeNotifier::start(db.clone(), config).unwrap();
        let (trigger, runs) = counting_trigger(&timers);
        notifier.register(SubscriptionId(7), trigger);

        assert_eq!(db.terminate_listeners(), 1);
        assert!(wait_for(|| notifier.reconnects() >= 1));
        // Reconnect fires everything once.
        assert!(wait_for(|| runs.load(Ordering::SeqCst) >= 1));
        assert!(wait_for(|| db.listener_count() == 1));

        let before = runs.load(Ordering::SeqCst);
        db.publish(vec![Fact::new("ns", json!(1))]).unwrap();
        assert!(wait_for(|| runs.load(Ordering::SeqCst) > before));
    }

    #[test]
    fn test_shutdown_closes_connection() {
        let (_dir, db, _timers) = setup();
        let notifier = ChangeNotifier::start(db.clone(), NotifierConfig::default()).unwrap();
        assert_eq!(db.listener_count(), 1);
        notifier.shutdown();
        assert_eq!(db.listener_count(), 0);
    }

    #[test]
    fn test_blocked_target_does_not_stall_other_triggers() {
        let (_dir, db, _) = setup();
        let timers = Arc::new(TimerPool::new(2).unwrap());
        let notifier = ChangeNotifier::start(db.clone(), NotifierConfig::default()).unwrap();

        let (_release, stuck) = crossbeam_channel::unbounded::<()>();
        let blocked = DebouncedTrigger::new(
            Duration::ZERO,
            Arc::clone(&timers),
            move || {
                let _ = stuck.recv();
            },
            || true,
        );
        let (healthy, runs) = counting_trigger(&timers);
        notifier.register(SubscriptionId(1), blocked.clone());
        notifier.register(SubscriptionId(2), healthy);

        for i in 0..5 {
            let before = runs.load(Ordering::SeqCst);
            db.publish(vec![Fact::new("ns", json!(i))]).unwrap();
            assert!(wait_for(|| runs.load(Ordering::SeqCst) > before));
        }
        assert!(blocked.is_running());
    }
}
