//! The query engine seam.
//!
//! Controllers only ever hand the engine a query string and get back a
//! columnar result or an error description. [`DataFusionEngine`] is the
//! implementation shipped with this crate.

use std::future::Future;

use arrow::record_batch::RecordBatch;

mod session;
mod span_join;

pub use session::{DataFusionEngine, SchedSlice, sched_batch};
pub use span_join::{SPAN_JOIN_FUNCTION, SpanWindow, split_spans};

/// What the engine hands back for one query. `error` is set instead of
/// failing the call, mirroring a remote engine that reports errors in-band.
#[derive(Debug, Default, Clone)]
pub struct QueryResult {
    pub batches: Vec<RecordBatch>,
    pub error: Option<String>,
}

impl QueryResult {
    pub fn ok(batches: Vec<RecordBatch>) -> Self {
        Self {
            batches,
            error: None,
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self {
            batches: vec![],
            error: Some(message.to_string()),
        }
    }

    pub fn num_records(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }
}

/// A shared query backend. Many controllers query the same engine
/// concurrently, each through its own uniquely named relations.
pub trait Engine: Send + Sync + 'static {
    fn query(&self, sql: &str) -> impl Future<Output = QueryResult> + Send;
}
