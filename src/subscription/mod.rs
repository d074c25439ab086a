//! Catchup and follow delivery of facts to consumers.
//!
//! Components:
//! - [`SubscriptionEngine`]: the per-subscription state machine
//! - [`PagedCatchup`]: historical replay through the staging table
//! - [`ChangeNotifier`]: the listening connection and trigger registry
//! - [`DebouncedTrigger`] on a shared [`TimerPool`]: follow-mode wake-ups

mod catchup;
mod engine;
mod notifier;
mod observer;
mod request;
mod stats;
mod timer;
mod trigger;

pub use catchup::{CatchupPass, CatchupSink, CatchupStrategy, PagedCatchup};
pub(crate) use engine::EngineContext;
pub use engine::{Phase, Subscription, SubscriptionEngine, SubscriptionId};
pub use notifier::{ChangeNotifier, NotifierConfig};
pub use observer::{
    from_fn, ChannelObserver, ErrorPolicy, FactObserver, FnObserver, SubscriptionEvent,
};
pub use request::SubscriptionRequest;
pub use stats::{PassKind, SubscriptionStats};
pub use timer::{TimerKey, TimerPool};
pub use trigger::DebouncedTrigger;
