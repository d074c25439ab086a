//! Per-subscription state machine.
//!
//! ```text
//! Initializing -> CatchingUp -> Following -> Closed
//!                           \-> Closed            (catchup requests)
//! ```
//!
//! Catchup runs on a thread of its own. Follow-mode passes run from the
//! subscription's debounced trigger on the shared timer workers.

use super::catchup::{CatchupStrategy, PagedCatchup};
use super::notifier::ChangeNotifier;
use super::observer::{ErrorPolicy, FactObserver};
use super::request::SubscriptionRequest;
use super::stats::{PassCounters, PassKind, SubscriptionStats};
use super::timer::TimerPool;
use super::trigger::DebouncedTrigger;
use crate::db::Database;
use crate::error::{Result, StoreError};
use crate::query::{PostQueryMatcher, QueryBuilder};
use crate::transform::{RequestedVersions, Transformer};
use crate::types::{Fact, Serial};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::any::Any;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle phase of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    CatchingUp,
    Following,
    Closed,
}

/// Collaborators shared by every subscription of one store.
pub(crate) struct EngineContext {
    pub db: Arc<Database>,
    pub notifier: Arc<ChangeNotifier>,
    pub timers: Arc<TimerPool>,
    pub transformer: Arc<Transformer>,
    pub default_fetch_size: usize,
}

/// Creates subscriptions and tracks the live ones.
pub struct SubscriptionEngine {
    ctx: Arc<EngineContext>,
    active: Arc<Mutex<HashMap<SubscriptionId, Weak<SubscriptionInner>>>>,
    next_id: AtomicU64,
}

impl SubscriptionEngine {
    pub(crate) fn new(ctx: EngineContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            active: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a subscription.
    ///
    /// Malformed specs and an unknown starting fact fail here, before
    /// anything is delivered.
    pub fn subscribe(
        &self,
        request: SubscriptionRequest,
        observer: Box<dyn FactObserver>,
    ) -> Result<Subscription> {
        let matcher = PostQueryMatcher::new(&request.specs)?;
        let versions = request.requested_versions()?;

        let start = if request.ephemeral {
            self.ctx.db.latest_serial()
        } else {
            match request.start {
                Some(id) => self
                    .ctx
                    .db
                    .serial_of(&id)
                    .ok_or(StoreError::FactNotFound(id))?,
                None => Serial::ZERO,
            }
        };

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let fetch_size = request.fetch_size.unwrap_or(self.ctx.default_fetch_size);
        let inner = Arc::new(SubscriptionInner {
            id,
            versions,
            catchup: Box::new(PagedCatchup::new(Arc::clone(&self.ctx.db), fetch_size)),
            request,
            matcher,
            ctx: Arc::clone(&self.ctx),
            active: Arc::downgrade(&self.active),
            observer: Mutex::new(observer),
            connected: AtomicBool::new(true),
            phase: Mutex::new(Phase::Initializing),
            cursor: AtomicU64::new(start.0),
            pass_lock: Mutex::new(()),
            stats: Mutex::new(SubscriptionStats {
                cursor: start,
                ..SubscriptionStats::default()
            }),
            trigger: Mutex::new(None),
        });

        self.active.lock().insert(id, Arc::downgrade(&inner));
        tracing::info!(
            subscription = %id,
            continuous = inner.request.continuous,
            ephemeral = inner.request.ephemeral,
            start = %start,
            debug_info = inner.request.debug_info.as_deref().unwrap_or(""),
            "subscription opened"
        );

        let worker = Arc::clone(&inner);
        let spawned = thread::Builder::new()
            .name(format!("factstore-{}", id))
            .spawn(move || worker.run_guarded());
        if let Err(e) = spawned {
            inner.close();
            return Err(e.into());
        }

        Ok(Subscription { inner })
    }

    /// Subscriptions not yet closed.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Close every live subscription.
    pub fn close_all(&self) {
        let live: Vec<Arc<SubscriptionInner>> = self
            .active
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for sub in live {
            sub.close();
        }
    }
}

struct SubscriptionInner {
    id: SubscriptionId,
    request: SubscriptionRequest,
    matcher: PostQueryMatcher,
    versions: RequestedVersions,
    catchup: Box<dyn CatchupStrategy>,
    ctx: Arc<EngineContext>,
    active: Weak<Mutex<HashMap<SubscriptionId, Weak<SubscriptionInner>>>>,

    observer: Mutex<Box<dyn FactObserver>>,

    /// Cleared on close; checked before every delivery.
    connected: AtomicBool,
    phase: Mutex<Phase>,

    /// Serial of the last fact handled. Only moves forward.
    cursor: AtomicU64,

    /// Serializes catchup and follow passes.
    pass_lock: Mutex<()>,

    stats: Mutex<SubscriptionStats>,
    trigger: Mutex<Option<DebouncedTrigger>>,
}

impl SubscriptionInner {
    /// Run the subscription. A panic in the observer fails the subscription
    /// instead of leaving it open with nobody delivering.
    fn run_guarded(self: Arc<Self>) {
        let sub = Arc::clone(&self);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(move || sub.run())) {
            self.fail(panicked(panic));
        }
    }

    fn run(self: Arc<Self>) {
        if let Err(e) = self.catch_up() {
            self.fail(e);
            return;
        }
        if !self.is_connected() {
            return;
        }

        self.observer.lock().on_catchup();
        tracing::info!(subscription = %self.id, cursor = %self.cursor(), "caught up");

        if self.request.continuous {
            self.follow();
        } else {
            self.close();
            self.observer.lock().on_complete();
        }
    }

    fn catch_up(&self) -> Result<()> {
        self.set_phase(Phase::CatchingUp);
        if self.request.ephemeral {
            return Ok(());
        }

        // The second pass picks up what was published while the first ran.
        for _ in 0..2 {
            let _pass = self.pass_lock.lock();
            if !self.is_connected() {
                return Ok(());
            }

            let query = QueryBuilder::new(&self.request.specs).build(self.cursor());
            tracing::debug!(subscription = %self.id, query = query.text(), "catchup pass");

            let mut counters = PassCounters::default();
            let result = self
                .catchup
                .catchup(&query, &mut |fact: Fact| self.deliver(fact, &mut counters));
            self.refresh_stats(PassKind::Catchup, &counters);

            if result?.stopped {
                return Ok(());
            }
        }
        Ok(())
    }

    fn follow(self: &Arc<Self>) {
        self.set_phase(Phase::Following);

        let target = Arc::downgrade(self);
        let live = Arc::downgrade(self);
        let trigger = DebouncedTrigger::new(
            self.request.max_batch_delay,
            Arc::clone(&self.ctx.timers),
            move || {
                if let Some(sub) = target.upgrade() {
                    sub.follow_pass();
                }
            },
            move || live.upgrade().map_or(false, |sub| sub.is_connected()),
        );

        *self.trigger.lock() = Some(trigger.clone());
        self.ctx.notifier.register(self.id, trigger.clone());
        if !self.is_connected() {
            // Closed while registering.
            self.ctx.notifier.unregister(self.id);
            trigger.cancel();
            return;
        }

        // Covers facts published before the registration took effect.
        self.follow_pass();
    }

    /// Deliver everything after the cursor.
    fn follow_pass(&self) {
        let _pass = self.pass_lock.lock();
        if !self.is_connected() {
            return;
        }

        let query = QueryBuilder::new(&self.request.specs).build(self.cursor());
        let mut counters = PassCounters::default();
        let result = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            let facts = self.ctx.db.query(&query)?;
            for fact in facts {
                if self.deliver(fact, &mut counters)?.is_break() {
                    break;
                }
            }
            Ok(())
        }))
        .unwrap_or_else(|panic| Err(panicked(panic)));
        self.refresh_stats(PassKind::Follow, &counters);

        if counters.rows_read > 0 {
            tracing::debug!(
                subscription = %self.id,
                rows = counters.rows_read,
                delivered = counters.delivered,
                cursor = %self.cursor(),
                "follow pass"
            );
        }
        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// Handle one row: match, transform, deliver, advance.
    fn deliver(&self, fact: Fact, counters: &mut PassCounters) -> Result<ControlFlow<()>> {
        if !self.is_connected() {
            return Ok(ControlFlow::Break(()));
        }
        let serial = fact.serial().ok_or_else(|| {
            StoreError::InvalidOperation(format!("fact {} has no serial", fact.id()))
        })?;
        if serial <= self.cursor() {
            return Ok(ControlFlow::Continue(()));
        }
        counters.rows_read += 1;

        if !self.matcher.test(&fact) {
            counters.filtered += 1;
            self.advance(serial);
            return Ok(ControlFlow::Continue(()));
        }

        let id = fact.id();
        let fact = match self.ctx.transformer.transform_if_necessary(fact, &self.versions) {
            Ok(fact) => fact,
            Err(e) => {
                counters.transformation_errors += 1;
                tracing::warn!(subscription = %self.id, fact = %id, error = %e, "transformation failed");
                match self.observer.lock().on_transformation_error(id, &e) {
                    ErrorPolicy::Skip => {
                        self.advance(serial);
                        return Ok(ControlFlow::Continue(()));
                    }
                    ErrorPolicy::Close => return Err(e),
                }
            }
        };

        self.observer.lock().on_fact(fact)?;
        counters.delivered += 1;
        self.advance(serial);
        Ok(ControlFlow::Continue(()))
    }

    fn fail(&self, error: StoreError) {
        if !self.is_connected() {
            tracing::debug!(subscription = %self.id, error = %error, "error after close ignored");
            return;
        }
        tracing::error!(subscription = %self.id, error = %error, "subscription failed");
        self.close();
        self.observer.lock().on_error(&error);
    }

    fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.phase.lock() = Phase::Closed;

        if let Some(trigger) = self.trigger.lock().take() {
            self.ctx.notifier.unregister(self.id);
            trigger.cancel();
        }
        if let Some(active) = self.active.upgrade() {
            active.lock().remove(&self.id);
        }
        tracing::info!(subscription = %self.id, cursor = %self.cursor(), "subscription closed");
    }

    fn advance(&self, serial: Serial) {
        self.cursor.fetch_max(serial.0, Ordering::SeqCst);
    }

    fn cursor(&self) -> Serial {
        Serial(self.cursor.load(Ordering::SeqCst))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: Phase) {
        let mut current = self.phase.lock();
        if *current != Phase::Closed {
            *current = phase;
        }
    }

    fn refresh_stats(&self, kind: PassKind, counters: &PassCounters) {
        let mut stats = self.stats.lock();
        *stats = stats.after_pass(kind, counters, self.cursor());
    }
}

fn panicked(panic: Box<dyn Any + Send>) -> StoreError {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    StoreError::Delivery(format!("observer panicked: {}", reason))
}

/// Handle to a running subscription. Dropping it closes the subscription.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.lock()
    }

    /// Serial of the last fact handled.
    pub fn cursor(&self) -> Serial {
        self.inner.cursor()
    }

    /// Stats as of the last finished pass.
    pub fn stats(&self) -> SubscriptionStats {
        self.inner.stats.lock().clone()
    }

    pub fn request(&self) -> &SubscriptionRequest {
        &self.inner.request
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.is_connected()
    }

    /// Stop delivery. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .field("cursor", &self.cursor())
            .finish()
    }
}
