//! Per-track controller: turns bounds changes into published track data.

use std::fmt;
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard, PoisonError};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::config::{ControllerSettings, CpuSliceConfig};
use crate::data::{DataKind, TimeWindow, TrackData};
use crate::engine::Engine;
use crate::fetch::{TrackQuery, fetch_slices, fetch_summary};
use crate::lod::{SummarizePolicy, WindowPlan};
use crate::query::QueryClient;
use crate::scaffold::{Scaffold, ScaffoldNames};

/// Sink for track data. Called once per completed fetch, never after the
/// controller is destroyed.
///
/// Runs with the controller's phase locked, so it must not call back into
/// the controller.
pub trait Publish: Send + Sync + 'static {
    fn publish(&self, data: TrackData);
}

impl<F> Publish for F
where
    F: Fn(TrackData) + Send + Sync + 'static,
{
    fn publish(&self, data: TrackData) {
        self(data)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No relations exist yet.
    Uninitialized,
    Idle,
    Fetching,
    Destroyed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Idle => "idle",
            Phase::Fetching => "fetching",
            Phase::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Outcome of [`Lifecycle::begin_fetch`].
pub enum Admission {
    Accepted(FetchGuard),
    Busy,
    Destroyed,
}

/// The controller's phase. At most one fetch is admitted at a time.
#[derive(Debug)]
pub struct Lifecycle {
    phase: SyncMutex<Phase>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            phase: SyncMutex::new(Phase::Uninitialized),
        }
    }
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        *self.lock()
    }

    pub fn is_destroyed(&self) -> bool {
        self.phase() == Phase::Destroyed
    }

    pub fn begin_fetch(self: &Arc<Self>) -> Admission {
        let mut phase = self.lock();
        match *phase {
            Phase::Uninitialized | Phase::Idle => {
                let ready = *phase == Phase::Idle;
                *phase = Phase::Fetching;
                Admission::Accepted(FetchGuard {
                    lifecycle: self.clone(),
                    ready,
                })
            }
            Phase::Fetching => Admission::Busy,
            Phase::Destroyed => Admission::Destroyed,
        }
    }

    /// Runs `f` unless destroyed. Destruction waits for `f` to return.
    pub fn unless_destroyed<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let phase = self.lock();
        if *phase == Phase::Destroyed {
            return None;
        }
        let out = f();
        drop(phase);
        Some(out)
    }

    /// Moves to `Destroyed`. Returns true if it already was.
    pub fn destroy(&self) -> bool {
        let mut phase = self.lock();
        let already = *phase == Phase::Destroyed;
        *phase = Phase::Destroyed;
        already
    }
}

/// Held for the duration of one fetch. Dropping it leaves `Fetching`,
/// however the fetch ended.
#[derive(Debug)]
pub struct FetchGuard {
    lifecycle: Arc<Lifecycle>,
    ready: bool,
}

impl FetchGuard {
    /// Records that the scaffold exists, so the next phase is `Idle`.
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        let mut phase = self.lifecycle.lock();
        if *phase == Phase::Fetching {
            *phase = if self.ready {
                Phase::Idle
            } else {
                Phase::Uninitialized
            };
        }
    }
}

/// Result of an awaited [`TrackController::refresh`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refresh {
    Published(DataKind),
    /// Another fetch was in flight.
    Dropped,
    Destroyed,
}

/// Result of [`TrackController::on_bounds_change`].
#[derive(Debug)]
pub enum BoundsChange {
    Started(JoinHandle<()>),
    Dropped,
    Rejected,
}

impl BoundsChange {
    pub fn is_started(&self) -> bool {
        matches!(self, BoundsChange::Started(_))
    }

    /// Waits for a started fetch to finish. Errors were already logged by
    /// the task.
    pub async fn wait(self) {
        if let BoundsChange::Started(handle) = self {
            if let Err(err) = handle.await {
                warn!(%err, "fetch task failed");
            }
        }
    }
}

struct Inner<E: Engine> {
    id: String,
    config: CpuSliceConfig,
    settings: ControllerSettings,
    policy: SummarizePolicy,
    client: QueryClient<E>,
    publisher: Arc<dyn Publish>,
    names: ScaffoldNames,
    lifecycle: Arc<Lifecycle>,
    scaffold: Mutex<Option<Scaffold<E>>>,
}

/// Drives one CPU track against a shared engine.
///
/// Relations are created on the first bounds change and dropped on
/// destruction. A bounds change arriving while a fetch is in flight is
/// dropped; the host re-issues bounds once data for the previous window
/// shows up.
pub struct TrackController<E: Engine> {
    inner: Arc<Inner<E>>,
}

impl<E: Engine> Clone for TrackController<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Engine> TrackController<E> {
    pub fn new(
        id: impl Into<String>,
        config: CpuSliceConfig,
        settings: ControllerSettings,
        engine: Arc<E>,
        publisher: Arc<dyn Publish>,
    ) -> Self {
        let id = id.into();
        let names = ScaffoldNames::unique(&id);
        let policy = SummarizePolicy::from(&settings);
        Self {
            inner: Arc::new(Inner {
                id,
                config,
                settings,
                policy,
                client: QueryClient::new(engine),
                publisher,
                names,
                lifecycle: Lifecycle::new(),
                scaffold: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn phase(&self) -> Phase {
        self.inner.lifecycle.phase()
    }

    pub fn scaffold_names(&self) -> &ScaffoldNames {
        &self.inner.names
    }

    /// Spawns a fetch for `window` on the current tokio runtime unless one is
    /// already running.
    pub fn on_bounds_change(&self, window: TimeWindow) -> BoundsChange {
        match self.inner.lifecycle.begin_fetch() {
            Admission::Accepted(guard) => {
                let inner = self.inner.clone();
                BoundsChange::Started(tokio::spawn(async move {
                    if let Err(err) = inner.run(guard, window).await {
                        error!(track = %inner.id, %err, "refresh failed");
                    }
                }))
            }
            Admission::Busy => {
                debug!(track = %self.inner.id, "fetch in flight, dropping bounds change");
                BoundsChange::Dropped
            }
            Admission::Destroyed => {
                debug!(track = %self.inner.id, "bounds change after destroy");
                BoundsChange::Rejected
            }
        }
    }

    /// Fetches and publishes data for `window` in the calling task.
    pub async fn refresh(&self, window: TimeWindow) -> Result<Refresh, Error> {
        match self.inner.lifecycle.begin_fetch() {
            Admission::Accepted(guard) => self.inner.run(guard, window).await,
            Admission::Busy => Ok(Refresh::Dropped),
            Admission::Destroyed => Ok(Refresh::Destroyed),
        }
    }

    /// Spawns [`TrackController::destroy`]; later bounds changes are
    /// rejected immediately.
    pub fn on_destroy(&self) -> JoinHandle<()> {
        self.inner.lifecycle.destroy();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.destroy().await {
                warn!(track = %inner.id, %err, "teardown failed");
            }
        })
    }

    /// Drops the track's relations once any in-flight fetch is done.
    /// Calling it again is a no-op.
    pub async fn destroy(&self) -> Result<(), Error> {
        self.inner.destroy().await
    }
}

impl<E: Engine> Inner<E> {
    #[tracing::instrument(skip_all, fields(track = %self.id, start = window.start, end = window.end))]
    async fn run(&self, mut guard: FetchGuard, window: TimeWindow) -> Result<Refresh, Error> {
        let plan = WindowPlan::new(&window, &self.policy);
        let mut slot = self.scaffold.lock().await;
        if self.lifecycle.is_destroyed() {
            return Ok(Refresh::Destroyed);
        }
        let scaffold = match slot.take() {
            Some(scaffold) => scaffold,
            None => Scaffold::create(&self.client, self.names.clone(), &self.settings).await?,
        };
        let scaffold = slot.insert(scaffold);
        guard.mark_ready();

        scaffold.set_window(&plan).await?;
        let query = TrackQuery::new(scaffold.span(), &self.settings, self.config.cpu);
        let data = if plan.is_quantized() {
            TrackData::Summary(fetch_summary(&self.client, &query, &window, &plan).await?)
        } else {
            TrackData::Slice(fetch_slices(&self.client, &query, &window, &plan).await?)
        };
        drop(slot);

        let kind = data.kind();
        let length = data.len();
        let published = self.lifecycle.unless_destroyed(|| {
            debug!(?kind, length, "publishing");
            self.publisher.publish(data);
        });
        match published {
            Some(()) => Ok(Refresh::Published(kind)),
            None => {
                debug!("destroyed during fetch, not publishing");
                Ok(Refresh::Destroyed)
            }
        }
    }

    async fn destroy(&self) -> Result<(), Error> {
        if self.lifecycle.destroy() {
            debug!(track = %self.id, "already destroyed");
        }
        let scaffold = self.scaffold.lock().await.take();
        match scaffold {
            Some(scaffold) => {
                scaffold.release().await?;
                info!(track = %self.id, "released track relations");
            }
            None => debug!(track = %self.id, "nothing to release"),
        }
        Ok(())
    }
}
