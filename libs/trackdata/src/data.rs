//! Data published to the host for one track and one visible window.
//!
//! Every value is in seconds. The engine works in integer nanoseconds, so the
//! conversions live here as well.

use serde::{Deserialize, Serialize};

/// Converts seconds to the engine's nanosecond domain, rounding to the
/// nearest nanosecond.
pub fn to_ns(seconds: f64) -> i64 {
    (seconds * 1e9).round() as i64
}

/// Converts engine nanoseconds back to seconds.
pub fn from_ns(ns: i64) -> f64 {
    ns as f64 / 1e9
}

/// The visible range of a track and its zoom, as reported by the host.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Seconds.
    pub start: f64,
    /// Seconds.
    pub end: f64,
    /// Seconds per pixel.
    pub resolution: f64,
}

impl TimeWindow {
    pub fn new(start: f64, end: f64, resolution: f64) -> Self {
        Self {
            start,
            end,
            resolution,
        }
    }
}

/// Per-bucket utilization of one partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryData {
    pub start: f64,
    pub end: f64,
    pub resolution: f64,
    pub length: usize,
    pub bucket_size_seconds: f64,
    /// One slot per bucket of the window; buckets without events stay `0.0`.
    pub utilizations: Vec<f64>,
}

/// Raw events of one partition, as parallel columns in query order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SliceData {
    pub start: f64,
    /// Requested end, or the end of the last slice when the row cap was hit.
    pub end: f64,
    pub resolution: f64,
    pub length: usize,
    pub ids: Vec<i64>,
    pub starts: Vec<f64>,
    pub ends: Vec<f64>,
    pub utids: Vec<u32>,
}

impl SliceData {
    pub fn with_capacity(start: f64, end: f64, resolution: f64, capacity: usize) -> Self {
        Self {
            start,
            end,
            resolution,
            length: 0,
            ids: Vec::with_capacity(capacity),
            starts: Vec::with_capacity(capacity),
            ends: Vec::with_capacity(capacity),
            utids: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, id: i64, start: f64, end: f64, utid: u32) {
        self.ids.push(id);
        self.starts.push(start);
        self.ends.push(end);
        self.utids.push(utid);
        self.length += 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Summary,
    Slice,
}

/// Envelope handed to [`crate::Publish`]; consumers dispatch on `kind`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackData {
    Summary(SummaryData),
    Slice(SliceData),
}

impl TrackData {
    pub fn kind(&self) -> DataKind {
        match self {
            TrackData::Summary(_) => DataKind::Summary,
            TrackData::Slice(_) => DataKind::Slice,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TrackData::Summary(summary) => summary.length,
            TrackData::Slice(slices) => slices.length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_summary(&self) -> Option<&SummaryData> {
        match self {
            TrackData::Summary(summary) => Some(summary),
            TrackData::Slice(_) => None,
        }
    }

    pub fn as_slices(&self) -> Option<&SliceData> {
        match self {
            TrackData::Slice(slices) => Some(slices),
            TrackData::Summary(_) => None,
        }
    }
}
