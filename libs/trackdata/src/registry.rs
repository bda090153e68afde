use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::Error;
use crate::config::{ControllerSettings, CpuSliceConfig, TrackSpec};
use crate::controller::{BoundsChange, Phase, Publish, TrackController};
use crate::data::TimeWindow;
use crate::engine::Engine;

pub const CPU_SLICE_TRACK_KIND: &str = "cpu_slices";

/// Object-safe face of a track controller.
pub trait TrackHandle: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> &'static str;
    fn phase(&self) -> Phase;
    fn on_bounds_change(&self, window: TimeWindow) -> BoundsChange;
    fn on_destroy(&self) -> JoinHandle<()>;
}

impl<E: Engine> TrackHandle for TrackController<E> {
    fn id(&self) -> &str {
        TrackController::id(self)
    }

    fn kind(&self) -> &'static str {
        CPU_SLICE_TRACK_KIND
    }

    fn phase(&self) -> Phase {
        TrackController::phase(self)
    }

    fn on_bounds_change(&self, window: TimeWindow) -> BoundsChange {
        TrackController::on_bounds_change(self, window)
    }

    fn on_destroy(&self) -> JoinHandle<()> {
        TrackController::on_destroy(self)
    }
}

pub type TrackFactory<E> = Box<
    dyn Fn(
            &TrackSpec,
            &ControllerSettings,
            Arc<E>,
            Arc<dyn Publish>,
        ) -> Result<Box<dyn TrackHandle>, Error>
        + Send
        + Sync,
>;

/// Maps a track kind to the constructor of its controller.
pub struct Registry<E> {
    settings: ControllerSettings,
    factories: HashMap<String, TrackFactory<E>>,
}

impl<E: Engine> Registry<E> {
    /// A registry with no kinds.
    pub fn empty(settings: ControllerSettings) -> Self {
        Self {
            settings,
            factories: HashMap::new(),
        }
    }

    /// A registry knowing the kinds shipped with this crate.
    pub fn new(settings: ControllerSettings) -> Self {
        let mut registry = Self::empty(settings);
        registry.register(CPU_SLICE_TRACK_KIND, Box::new(cpu_slice_track::<E>));
        registry
    }

    /// Returns the factory previously registered for `kind`, if any.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: TrackFactory<E>,
    ) -> Option<TrackFactory<E>> {
        self.factories.insert(kind.into(), factory)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(
        &self,
        spec: &TrackSpec,
        engine: Arc<E>,
        publisher: Arc<dyn Publish>,
    ) -> Result<Box<dyn TrackHandle>, Error> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| Error::UnknownTrackKind(spec.kind.clone()))?;
        debug!(track = %spec.id, kind = %spec.kind, "creating track");
        factory(spec, &self.settings, engine, publisher)
    }
}

fn cpu_slice_track<E: Engine>(
    spec: &TrackSpec,
    settings: &ControllerSettings,
    engine: Arc<E>,
    publisher: Arc<dyn Publish>,
) -> Result<Box<dyn TrackHandle>, Error> {
    let config: CpuSliceConfig =
        spec.config
            .clone()
            .try_into()
            .map_err(|source| Error::InvalidTrackConfig {
                track: spec.id.clone(),
                source,
            })?;
    Ok(Box::new(TrackController::new(
        spec.id.clone(),
        config,
        settings.clone(),
        engine,
        publisher,
    )))
}
