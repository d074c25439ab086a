//! Consumer callbacks and the channel adapter.

use crate::error::{Result, StoreError};
use crate::types::{Fact, FactId};
use crossbeam_channel::Sender;

/// What to do when a fact cannot be transformed to a requested version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Report and move past the fact.
    Skip,
    /// Terminate the subscription.
    Close,
}

/// Receives a subscription's facts and lifecycle signals.
///
/// Calls come from store threads, one at a time, in this order: `on_fact`
/// any number of times in serial order, `on_catchup` once, then either
/// `on_complete` (catchup requests) or more `on_fact` calls until the
/// subscription closes. `on_error` ends the stream.
pub trait FactObserver: Send {
    /// An `Err` terminates the subscription.
    fn on_fact(&mut self, fact: Fact) -> Result<()>;

    fn on_catchup(&mut self) {}

    fn on_complete(&mut self) {}

    fn on_error(&mut self, _error: &StoreError) {}

    fn on_transformation_error(&mut self, _id: FactId, _error: &StoreError) -> ErrorPolicy {
        ErrorPolicy::Skip
    }
}

/// Adapter for a closure handling facts only.
pub struct FnObserver<F>(F);

/// Observe facts with a closure.
pub fn from_fn<F>(f: F) -> FnObserver<F>
where
    F: FnMut(Fact) -> Result<()> + Send,
{
    FnObserver(f)
}

impl<F> FactObserver for FnObserver<F>
where
    F: FnMut(Fact) -> Result<()> + Send,
{
    fn on_fact(&mut self, fact: Fact) -> Result<()> {
        (self.0)(fact)
    }
}

/// Events emitted on a subscription channel.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    Fact(Fact),
    /// Catchup finished; following (or completing) from here.
    CaughtUp,
    /// A catchup request delivered everything.
    Complete,
    /// The subscription failed and is closed.
    Error(String),
    /// A fact was skipped because it could not be transformed.
    TransformationFailed { id: FactId, reason: String },
}

/// Forwards everything to a channel. Blocks when the channel is full; a
/// dropped receiver terminates the subscription.
pub struct ChannelObserver {
    sender: Sender<SubscriptionEvent>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<SubscriptionEvent>) -> Self {
        Self { sender }
    }
}

impl FactObserver for ChannelObserver {
    fn on_fact(&mut self, fact: Fact) -> Result<()> {
        self.sender
            .send(SubscriptionEvent::Fact(fact))
            .map_err(|_| StoreError::Delivery("subscription receiver dropped".into()))
    }

    fn on_catchup(&mut self) {
        let _ = self.sender.send(SubscriptionEvent::CaughtUp);
    }

    fn on_complete(&mut self) {
        let _ = self.sender.send(SubscriptionEvent::Complete);
    }

    fn on_error(&mut self, error: &StoreError) {
        let _ = self.sender.send(SubscriptionEvent::Error(error.to_string()));
    }

    fn on_transformation_error(&mut self, id: FactId, error: &StoreError) -> ErrorPolicy {
        let event = SubscriptionEvent::TransformationFailed {
            id,
            reason: error.to_string(),
        };
        match self.sender.send(event) {
            Ok(()) => ErrorPolicy::Skip,
            Err(_) => ErrorPolicy::Close,
        }
    }
}
