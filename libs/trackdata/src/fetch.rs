//! Queries against a span view and decoding of their results.

use tracing::{debug, warn};

use crate::Error;
use crate::config::ControllerSettings;
use crate::data::{SliceData, SummaryData, TimeWindow, from_ns};
use crate::engine::Engine;
use crate::lod::WindowPlan;
use crate::query::QueryClient;

/// One partition of one span view.
#[derive(Clone, Copy, Debug)]
pub struct TrackQuery<'a> {
    pub span: &'a str,
    pub settings: &'a ControllerSettings,
    pub cpu: u32,
}

impl<'a> TrackQuery<'a> {
    pub fn new(span: &'a str, settings: &'a ControllerSettings, cpu: u32) -> Self {
        Self {
            span,
            settings,
            cpu,
        }
    }

    fn filter(&self) -> String {
        format!(
            "{} = {} AND utid != {}",
            self.settings.partition_column, self.cpu, self.settings.idle_utid
        )
    }

    pub fn summary_sql(&self, bucket_ns: i64) -> String {
        format!(
            "SELECT quantum_ts AS bucket, sum(dur) / CAST({bucket_ns} AS DOUBLE) AS utilization \
             FROM {} WHERE {} GROUP BY quantum_ts LIMIT {}",
            self.span,
            self.filter(),
            self.settings.summary_limit
        )
    }

    pub fn slice_sql(&self) -> String {
        format!(
            "SELECT ts, dur, utid, row_id FROM {} WHERE {} ORDER BY ts LIMIT {}",
            self.span,
            self.filter(),
            self.settings.slice_limit
        )
    }
}

/// Per-bucket utilization over the window. Expects the window relation to
/// have been written from `plan` with quantization on.
pub async fn fetch_summary<E: Engine>(
    client: &QueryClient<E>,
    query: &TrackQuery<'_>,
    window: &TimeWindow,
    plan: &WindowPlan,
) -> Result<SummaryData, Error> {
    let bucket_ns = plan.quantum().max(1);
    let columns = client.query(&query.summary_sql(bucket_ns)).await?;
    let buckets = columns.i64s(0)?;
    let utilizations = columns.f64s(1)?;

    // the end stays as requested even when the row cap truncated the result
    let mut summary = SummaryData {
        start: plan.window_start(),
        end: window.end,
        resolution: window.resolution,
        length: 0,
        bucket_size_seconds: from_ns(bucket_ns),
        utilizations: vec![0.0; plan.bucket_count()],
    };
    let mut skipped = 0usize;
    for (bucket, utilization) in buckets.values().iter().zip(utilizations.values().iter()) {
        let slot = usize::try_from(*bucket)
            .ok()
            .and_then(|bucket| summary.utilizations.get_mut(bucket));
        match slot {
            Some(slot) => {
                *slot = *utilization;
                summary.length += 1;
            }
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(
            span = query.span,
            skipped,
            buckets = summary.utilizations.len(),
            "summary rows outside the window"
        );
    }
    debug!(span = query.span, length = summary.length, "fetched summary");
    Ok(summary)
}

/// Raw slices in the window, at most `slice_limit` of them.
pub async fn fetch_slices<E: Engine>(
    client: &QueryClient<E>,
    query: &TrackQuery<'_>,
    window: &TimeWindow,
    plan: &WindowPlan,
) -> Result<SliceData, Error> {
    let columns = client.query(&query.slice_sql()).await?;
    let ts = columns.i64s(0)?;
    let dur = columns.i64s(1)?;
    let utid = columns.i64s(2)?;
    let ids = columns.i64s(3)?;

    let rows = columns.num_records();
    let mut slices =
        SliceData::with_capacity(plan.window_start(), window.end, window.resolution, rows);
    for row in 0..rows {
        let start = from_ns(ts.value(row));
        let end = start + from_ns(dur.value(row));
        slices.push(ids.value(row), start, end, utid.value(row) as u32);
    }
    // a full page means there may be more; only claim what was returned
    if rows == query.settings.slice_limit {
        if let Some(&last) = slices.ends.last() {
            slices.end = last;
        }
    }
    debug!(span = query.span, length = slices.length, "fetched slices");
    Ok(slices)
}
