//! Historical replay.

use crate::db::{ClientId, Database};
use crate::error::Result;
use crate::query::FactQuery;
use crate::types::{Fact, Serial};
use std::ops::ControlFlow;
use std::sync::Arc;

/// Per-row sink of a catchup pass. `Break` stops the pass without error.
pub type CatchupSink<'a> = dyn FnMut(Fact) -> Result<ControlFlow<()>> + 'a;

/// Summary of one catchup pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatchupPass {
    pub staged: usize,
    pub pages: u64,
    pub rows: u64,
    /// The sink stopped the pass early.
    pub stopped: bool,
}

/// A way of replaying the facts matching a query, in serial order.
pub trait CatchupStrategy: Send + Sync {
    fn catchup(&self, query: &FactQuery, sink: &mut CatchupSink<'_>) -> Result<CatchupPass>;
}

/// Pins the result set in the staging table, then pages through it.
pub struct PagedCatchup {
    db: Arc<Database>,
    fetch_size: usize,
}

impl PagedCatchup {
    pub fn new(db: Arc<Database>, fetch_size: usize) -> Self {
        Self {
            db,
            fetch_size: fetch_size.max(1),
        }
    }

    fn run(
        &self,
        client: ClientId,
        query: &FactQuery,
        sink: &mut CatchupSink<'_>,
    ) -> Result<CatchupPass> {
        let mut pass = CatchupPass {
            staged: self.db.stage_catchup(client, query)?,
            ..CatchupPass::default()
        };
        tracing::debug!(client = client.0, staged = pass.staged, after = %query.after(), "catchup staged");

        let mut after: Serial = query.after();
        loop {
            let page = self.db.catchup_page(client, after, self.fetch_size)?;
            if page.is_empty() {
                break;
            }
            pass.pages += 1;

            for fact in page {
                if let Some(serial) = fact.serial() {
                    after = serial;
                }
                pass.rows += 1;
                if sink(fact)?.is_break() {
                    pass.stopped = true;
                    return Ok(pass);
                }
            }
        }
        Ok(pass)
    }
}

impl CatchupStrategy for PagedCatchup {
    fn catchup(&self, query: &FactQuery, sink: &mut CatchupSink<'_>) -> Result<CatchupPass> {
        let staging = Staging {
            db: &self.db,
            client: self.db.next_client_id(),
        };
        self.run(staging.client, query, sink)
    }
}

/// Deletes a client's staging rows on every exit path, unwinding included.
struct Staging<'a> {
    db: &'a Database,
    client: ClientId,
}

impl Drop for Staging<'_> {
    fn drop(&mut self) {
        self.db.clear_catchup(self.client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::query::{FactSpec, QueryBuilder};
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(n: usize) -> (TempDir, Arc<Database>) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(dir.path().join("facts.log"), 1, 4).unwrap());
        for i in 0..n {
            let ns = if i % 3 == 0 { "other" } else { "ns" };
            db.publish(vec![Fact::new(ns, json!(i))]).unwrap();
        }
        (dir, db)
    }

    #[test]
    fn test_pages_through_all_matches_in_order() {
        let (_dir, db) = setup(10);
        let catchup = PagedCatchup::new(Arc::clone(&db), 2);
        let query = QueryBuilder::new(&[FactSpec::ns("ns")]).build(Serial::ZERO);

        let mut seen = Vec::new();
        let pass = catchup
            .catchup(&query, &mut |fact: Fact| {
                seen.push(fact.serial().unwrap());
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();

        assert_eq!(pass.staged, 6);
        assert_eq!(pass.rows, 6);
        assert_eq!(pass.pages, 3);
        assert!(!pass.stopped);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(db.staged_rows(), 0);
    }

    #[test]
    fn test_break_stops_and_clears_staging() {
        let (_dir, db) = setup(10);
        let catchup = PagedCatchup::new(Arc::clone(&db), 3);
        let query = QueryBuilder::new(&[FactSpec::ns("ns")]).build(Serial::ZERO);

        let mut count = 0;
        let pass = catchup
            .catchup(&query, &mut |_fact: Fact| {
                count += 1;
                Ok(if count == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })
            .unwrap();

        assert!(pass.stopped);
        assert_eq!(pass.rows, 2);
        assert_eq!(db.staged_rows(), 0);
    }

    #[test]
    fn test_sink_error_propagates_and_clears_staging() {
        let (_dir, db) = setup(5);
        let catchup = PagedCatchup::new(Arc::clone(&db), 10);
        let query = QueryBuilder::new(&[FactSpec::ns("ns")]).build(Serial::ZERO);

        let result = catchup.catchup(&query, &mut |_fact: Fact| {
            Err(StoreError::Delivery("refused".into()))
        });
        assert!(matches!(result, Err(StoreError::Delivery(_))));
        assert_eq!(db.staged_rows(), 0);
    }

    #[test]
    fn test_starts_after_lower_bound() {
        let (_dir, db) = setup(10);
        let catchup = PagedCatchup::new(Arc::clone(&db), 3);
        let query = QueryBuilder::new(&[FactSpec::ns("ns")]).build(Serial(8));

        let mut seen = Vec::new();
        catchup
            .catchup(&query, &mut |fact: Fact| {
                seen.push(fact.serial().unwrap());
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(seen, vec![Serial(9)]);
    }

    #[test]
    fn test_panicking_sink_clears_staging() {
        let (_dir, db) = setup(10);
        let catchup = PagedCatchup::new(Arc::clone(&db), 2);
        let query = QueryBuilder::new(&[FactSpec::ns("ns")]).build(Serial::ZERO);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = catchup.catchup(&query, &mut |_fact: Fact| panic!("sink failed"));
        }));
        assert!(result.is_err());
        assert_eq!(db.staged_rows(), 0);
    }
}
