//! Data controller for CPU scheduling tracks.
//!
//! A [`TrackController`] listens for changes to a track's visible window,
//! queries a shared [`Engine`] for either raw slices or per-bucket
//! utilization depending on zoom, and hands the result to a [`Publish`] sink.

pub use config::{ControllerSettings, CpuSliceConfig, Settings, TrackSpec};
pub use controller::{
    Admission, BoundsChange, FetchGuard, Lifecycle, Phase, Publish, Refresh, TrackController,
};
pub use data::{DataKind, SliceData, SummaryData, TimeWindow, TrackData};
pub use engine::{DataFusionEngine, Engine, QueryResult, SchedSlice};
pub use error::Error;
pub use registry::{CPU_SLICE_TRACK_KIND, Registry, TrackFactory, TrackHandle};

pub mod config;
pub mod controller;
pub mod data;
pub mod engine;
mod error;
pub mod fetch;
pub mod lod;
pub mod query;
pub mod registry;
pub mod scaffold;
