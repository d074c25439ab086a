//! What a consumer asks to receive.

use crate::error::Result;
use crate::query::FactSpec;
use crate::transform::RequestedVersions;
use crate::types::FactId;
use std::time::Duration;

/// Subscription request.
#[derive(Clone, Debug)]
pub struct SubscriptionRequest {
    /// Facts matching any spec are delivered.
    pub specs: Vec<FactSpec>,

    /// Keep following new facts after catchup.
    pub continuous: bool,

    /// Skip the backlog and start at the current tail.
    pub ephemeral: bool,

    /// Deliver only facts published after this one (None = from scratch).
    pub start: Option<FactId>,

    /// Debounce window for follow-mode re-queries. Zero re-queries on every
    /// notification.
    pub max_batch_delay: Duration,

    /// Catchup page size (None = store default).
    pub fetch_size: Option<usize>,

    /// Free-form label carried into log lines.
    pub debug_info: Option<String>,
}

impl SubscriptionRequest {
    /// Replay matching history, then complete.
    pub fn catchup(specs: Vec<FactSpec>) -> Self {
        Self {
            specs,
            continuous: false,
            ephemeral: false,
            start: None,
            max_batch_delay: Duration::ZERO,
            fetch_size: None,
            debug_info: None,
        }
    }

    /// Replay matching history, then keep delivering new facts.
    pub fn follow(specs: Vec<FactSpec>) -> Self {
        Self {
            continuous: true,
            ..Self::catchup(specs)
        }
    }

    pub fn from_scratch(mut self) -> Self {
        self.start = None;
        self
    }

    pub fn after(mut self, id: FactId) -> Self {
        self.start = Some(id);
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn with_max_batch_delay(mut self, delay: Duration) -> Self {
        self.max_batch_delay = delay;
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = Some(fetch_size.max(1));
        self
    }

    pub fn with_debug_info(mut self, info: impl Into<String>) -> Self {
        self.debug_info = Some(info.into());
        self
    }

    /// Versions requested through the specs.
    pub fn requested_versions(&self) -> Result<RequestedVersions> {
        RequestedVersions::from_specs(&self.specs)
    }
}
