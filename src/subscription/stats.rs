//! Per-subscription counters.

use crate::types::Serial;

/// Which kind of pass produced a stats snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    Catchup,
    Follow,
}

/// Snapshot of a subscription's progress, replaced at every pass boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub catchup_passes: u64,
    pub follow_passes: u64,

    /// Rows read from the backend.
    pub rows_read: u64,

    /// Rows rejected by the post-query matcher.
    pub filtered: u64,

    pub delivered: u64,
    pub transformation_errors: u64,

    /// Cursor at the end of the last pass.
    pub cursor: Serial,

    pub last_pass: Option<PassKind>,
}

/// Counters local to one pass.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PassCounters {
    pub rows_read: u64,
    pub filtered: u64,
    pub delivered: u64,
    pub transformation_errors: u64,
}

impl SubscriptionStats {
    /// The snapshot after a pass of `kind` finished with `pass` at `cursor`.
    pub(crate) fn after_pass(&self, kind: PassKind, pass: &PassCounters, cursor: Serial) -> Self {
        let (catchup_passes, follow_passes) = match kind {
            PassKind::Catchup => (self.catchup_passes + 1, self.follow_passes),
            PassKind::Follow => (self.catchup_passes, self.follow_passes + 1),
        };
        Self {
            catchup_passes,
            follow_passes,
            rows_read: self.rows_read + pass.rows_read,
            filtered: self.filtered + pass.filtered,
            delivered: self.delivered + pass.delivered,
            transformation_errors: self.transformation_errors + pass.transformation_errors,
            cursor,
            last_pass: Some(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_pass_accumulates() {
        let pass = PassCounters {
            rows_read: 5,
            filtered: 2,
            delivered: 3,
            transformation_errors: 0,
        };
        let stats = SubscriptionStats::default()
            .after_pass(PassKind::Catchup, &pass, Serial(5))
            .after_pass(PassKind::Follow, &pass, Serial(9));

        assert_eq!(stats.catchup_passes, 1);
        assert_eq!(stats.follow_passes, 1);
        assert_eq!(stats.rows_read, 10);
        assert_eq!(stats.delivered, 6);
        assert_eq!(stats.cursor, Serial(9));
        assert_eq!(stats.last_pass, Some(PassKind::Follow));
    }
}
