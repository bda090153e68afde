//! Level-of-detail selection.
//!
//! Given the visible window and its resolution, decides whether a track shows
//! raw slices or per-bucket utilization, and how wide a bucket is. Nothing is
//! cached between calls: every bounds change is planned from scratch and the
//! window relation is simply overwritten with the result.

use crate::config::{ControllerSettings, DEFAULT_MAX_BUCKETS};
use crate::data::{TimeWindow, from_ns, to_ns};

/// Threshold policy for switching to summaries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SummarizePolicy {
    /// Seconds per pixel.
    pub threshold: f64,
    pub pixels_per_bucket: u32,
    /// Upper bound on the buckets of one summary. Buckets are widened past
    /// `pixels_per_bucket` when a window would need more.
    pub max_buckets: usize,
}

impl SummarizePolicy {
    pub fn new(threshold: f64, pixels_per_bucket: u32) -> Self {
        Self {
            threshold,
            pixels_per_bucket: pixels_per_bucket.max(1),
            max_buckets: DEFAULT_MAX_BUCKETS,
        }
    }

    /// At least two buckets are always allowed, one of them for the partial
    /// bucket in front of an aligned start.
    pub fn with_max_buckets(mut self, max_buckets: usize) -> Self {
        self.max_buckets = max_buckets.max(2);
        self
    }

    pub fn should_summarize(&self, resolution: f64) -> bool {
        resolution >= self.threshold
    }

    /// Width in nanoseconds of one bucket covering `pixels_per_bucket` pixels.
    pub fn bucket_size_ns(&self, resolution: f64) -> i64 {
        to_ns(resolution * self.pixels_per_bucket as f64).max(1)
    }
}

impl From<&ControllerSettings> for SummarizePolicy {
    fn from(settings: &ControllerSettings) -> Self {
        Self::new(settings.summarize_threshold, settings.pixels_per_bucket)
            .with_max_buckets(settings.max_buckets)
    }
}

/// Values written to the window relation for one update, plus what the
/// fetchers need to decode the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowPlan {
    pub start_ns: i64,
    pub end_ns: i64,
    /// Start of the window relation. Aligned down to a bucket boundary when
    /// quantized so buckets stay put while panning.
    pub window_start_ns: i64,
    /// Never less than 1.
    pub window_dur_ns: i64,
    /// `Some` when the track should be summarized.
    pub bucket_size_ns: Option<i64>,
}

impl WindowPlan {
    pub fn new(window: &TimeWindow, policy: &SummarizePolicy) -> Self {
        let start_ns = to_ns(window.start);
        let end_ns = to_ns(window.end);
        let bucket_size_ns = policy.should_summarize(window.resolution).then(|| {
            let bucket = policy.bucket_size_ns(window.resolution);
            if buckets_between(align(start_ns, bucket), end_ns, bucket) <= policy.max_buckets {
                return bucket;
            }
            let slots =
                i64::try_from(policy.max_buckets.saturating_sub(1).max(1)).unwrap_or(i64::MAX);
            bucket.max(div_ceil(end_ns.saturating_sub(start_ns), slots))
        });
        let window_start_ns = match bucket_size_ns {
            Some(bucket) => align(start_ns, bucket),
            None => start_ns,
        };
        let window_dur_ns = end_ns.saturating_sub(window_start_ns).max(1);
        Self {
            start_ns,
            end_ns,
            window_start_ns,
            window_dur_ns,
            bucket_size_ns,
        }
    }

    pub fn is_quantized(&self) -> bool {
        self.bucket_size_ns.is_some()
    }

    /// Value of the window relation's `quantum` column; `0` disables
    /// quantization and yields one row per event.
    pub fn quantum(&self) -> i64 {
        self.bucket_size_ns.unwrap_or(0)
    }

    /// Number of buckets between the aligned start and the requested end.
    pub fn bucket_count(&self) -> usize {
        match self.bucket_size_ns {
            Some(bucket) => buckets_between(self.window_start_ns, self.end_ns, bucket),
            None => 0,
        }
    }

    /// Start reported to the host, in seconds.
    pub fn window_start(&self) -> f64 {
        from_ns(self.window_start_ns)
    }
}

/// Largest multiple of `bucket` not after `ns`, or `i64::MIN` when that is
/// not representable.
fn align(ns: i64, bucket: i64) -> i64 {
    ns.saturating_sub(ns.rem_euclid(bucket))
}

fn buckets_between(start_ns: i64, end_ns: i64, bucket: i64) -> usize {
    let span = end_ns.saturating_sub(start_ns).max(0);
    usize::try_from(div_ceil(span, bucket)).unwrap_or(usize::MAX)
}

/// `n / d` rounded up, for `n >= 0` and `d > 0`.
fn div_ceil(n: i64, d: i64) -> i64 {
    n / d + i64::from(n % d != 0)
}
