//! Relations owned by one controller instance.
//!
//! Every controller gets a window relation holding a single
//! `(window_start, window_dur, quantum)` row and a span view joining the event
//! table against it. Names are unique per instance so controllers sharing an
//! engine never see each other's windows.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::Error;
use crate::config::ControllerSettings;
use crate::engine::{Engine, SPAN_JOIN_FUNCTION};
use crate::lod::WindowPlan;
use crate::query::QueryClient;

static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaffoldNames {
    pub window: String,
    pub span: String,
}

impl ScaffoldNames {
    /// Names for a new controller of `track`, never handed out twice within
    /// the process.
    pub fn unique(track: &str) -> Self {
        let seq = INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed);
        Self::with_prefix(&format!("track_{}_{seq}", sanitize(track)))
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            window: format!("{prefix}_window"),
            span: format!("{prefix}_span"),
        }
    }
}

/// Lowercased, with anything but ASCII alphanumerics replaced by `_`, so the
/// result is a valid unquoted identifier fragment.
fn sanitize(track: &str) -> String {
    track
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Handle to a created window relation and span view.
///
/// Give it back through [`Scaffold::release`]. A handle dropped without
/// release drops both relations from a background task on the current tokio
/// runtime, or leaves them behind when there is none.
pub struct Scaffold<E: Engine> {
    names: ScaffoldNames,
    client: QueryClient<E>,
    released: bool,
}

impl<E: Engine> Scaffold<E> {
    /// Creates both relations, replacing any left over from an earlier
    /// attempt under the same names.
    pub async fn create(
        client: &QueryClient<E>,
        names: ScaffoldNames,
        settings: &ControllerSettings,
    ) -> Result<Self, Error> {
        client
            .query(&format!(
                "CREATE OR REPLACE TABLE {} AS SELECT CAST(0 AS BIGINT) AS window_start, \
                 CAST(1 AS BIGINT) AS window_dur, CAST(0 AS BIGINT) AS quantum",
                names.window
            ))
            .await?;
        let span = format!(
            "CREATE OR REPLACE VIEW {} AS SELECT * FROM {SPAN_JOIN_FUNCTION}('{}', '{}', '{}')",
            names.span, settings.event_table, settings.partition_column, names.window
        );
        if let Err(err) = client.query(&span).await {
            if let Err(drop_err) = client
                .query(&format!("DROP TABLE IF EXISTS {}", names.window))
                .await
            {
                warn!(window = %names.window, %drop_err, "failed to drop window after setup error");
            }
            return Err(err);
        }
        debug!(window = %names.window, span = %names.span, "created scaffold");
        Ok(Self {
            names,
            client: client.clone(),
            released: false,
        })
    }

    pub fn span(&self) -> &str {
        &self.names.span
    }

    /// Overwrites the window row. The span view picks it up on its next scan.
    pub async fn set_window(&self, plan: &WindowPlan) -> Result<(), Error> {
        self.client
            .query(&format!(
                "UPDATE {} SET window_start = {}, window_dur = {}, quantum = {}",
                self.names.window,
                plan.window_start_ns,
                plan.window_dur_ns,
                plan.quantum()
            ))
            .await?;
        Ok(())
    }

    /// Drops the span view and then the window relation. Both drops are
    /// attempted even if the first fails.
    pub async fn release(mut self) -> Result<(), Error> {
        self.released = true;
        drop_relations(&self.client, &self.names).await?;
        debug!(window = %self.names.window, span = %self.names.span, "released scaffold");
        Ok(())
    }
}

async fn drop_relations<E: Engine>(
    client: &QueryClient<E>,
    names: &ScaffoldNames,
) -> Result<(), Error> {
    let span = client.query(&format!("DROP VIEW {}", names.span)).await;
    let window = client
        .query(&format!("DROP TABLE {}", names.window))
        .await;
    span.and(window)?;
    Ok(())
}

impl<E: Engine> fmt::Debug for Scaffold<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scaffold")
            .field("names", &self.names)
            .field("released", &self.released)
            .finish()
    }
}

impl<E: Engine> Drop for Scaffold<E> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let names = self.names.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                window = %names.window,
                span = %names.span,
                "scaffold dropped outside a runtime, relations left behind"
            );
            return;
        };
        debug!(window = %names.window, span = %names.span, "releasing dropped scaffold");
        let client = self.client.clone();
        runtime.spawn(async move {
            if let Err(err) = drop_relations(&client, &names).await {
                warn!(window = %names.window, span = %names.span, %err, "failed to release dropped scaffold");
            }
        });
    }
}
