use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Error;

pub const CONFIG_ENV: &str = "TRACKDATA_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "./trackdata.toml";

/// Resolution (seconds per pixel) at and above which tracks publish bucket
/// summaries instead of raw slices. At ~1000px wide this is a 0.8s view.
pub const DEFAULT_SUMMARIZE_THRESHOLD: f64 = 0.0008;
pub const DEFAULT_PIXELS_PER_BUCKET: u32 = 10;
pub const DEFAULT_SLICE_LIMIT: usize = 10_000;
pub const DEFAULT_SUMMARY_LIMIT: usize = 1_000_000;
pub const DEFAULT_MAX_BUCKETS: usize = 1_000_000;

/// Knobs shared by every controller created from the same settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ControllerSettings {
    pub summarize_threshold: f64,
    pub pixels_per_bucket: u32,
    pub slice_limit: usize,
    pub summary_limit: usize,
    /// Most buckets a summary may hold; wider views get wider buckets.
    pub max_buckets: usize,
    /// Event table the span relations are built over.
    pub event_table: String,
    pub partition_column: String,
    /// `utid` of rows that belong to no thread (the idle task).
    pub idle_utid: i64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            summarize_threshold: DEFAULT_SUMMARIZE_THRESHOLD,
            pixels_per_bucket: DEFAULT_PIXELS_PER_BUCKET,
            slice_limit: DEFAULT_SLICE_LIMIT,
            summary_limit: DEFAULT_SUMMARY_LIMIT,
            max_buckets: DEFAULT_MAX_BUCKETS,
            event_table: "sched".to_string(),
            partition_column: "cpu".to_string(),
            idle_utid: 0,
        }
    }
}

/// Configuration of a `cpu_slices` track.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSliceConfig {
    pub cpu: u32,
}

/// A track the host wants built at startup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackSpec {
    pub id: String,
    pub kind: String,
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(Default::default())
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub controller: ControllerSettings,
    pub tracks: Vec<TrackSpec>,
}

impl Settings {
    /// Loads settings from `path` if given, otherwise from `$TRACKDATA_CONFIG`
    /// or `./trackdata.toml`, falling back to defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self, Error> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::ConfigNotFound(path.display().to_string()));
            }
            return Self::read(path);
        }
        let candidates = std::env::var(CONFIG_ENV)
            .into_iter()
            .chain([DEFAULT_CONFIG_PATH.to_string()])
            .map(PathBuf::from);
        for path in candidates {
            if path.exists() {
                return Self::read(path);
            }
        }
        debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    pub fn read(path: PathBuf) -> Result<Self, Error> {
        let config = std::fs::read_to_string(&path)?;
        let settings = Self::parse(&config)?;
        debug!(?path, tracks = settings.tracks.len(), "loaded config");
        Ok(settings)
    }

    pub fn parse(config: &str) -> Result<Self, Error> {
        Ok(toml::from_str(config)?)
    }
}
