#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::{Notify, Semaphore};
    use trackdata::{
        BoundsChange, ControllerSettings, CpuSliceConfig, DataFusionEngine, DataKind, Engine,
        Phase, Publish, QueryResult, Refresh, Registry, SchedSlice, Settings, TimeWindow,
        TrackController, TrackData,
    };

    const MS: i64 = 1_000_000;

    fn init_tracing() {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    fn slice(row_id: i64, ts: i64, dur: i64, cpu: i64, utid: i64) -> SchedSlice {
        SchedSlice {
            row_id,
            ts,
            dur,
            cpu,
            utid,
        }
    }

    /// Two slices on cpu 0: [0, 500ms) for utid 1 and [600ms, 700ms) for utid 2.
    fn example_slices() -> Vec<SchedSlice> {
        vec![slice(1, 0, 500 * MS, 0, 1), slice(2, 600 * MS, 100 * MS, 0, 2)]
    }

    fn engine(slices: &[SchedSlice]) -> DataFusionEngine {
        init_tracing();
        let engine = DataFusionEngine::new().unwrap();
        engine.register_slices("sched", slices).unwrap();
        engine
    }

    type Published = Arc<Mutex<Vec<TrackData>>>;

    fn recorder() -> (Arc<dyn Publish>, Published) {
        let published = Published::default();
        let sink = published.clone();
        let publisher: Arc<dyn Publish> = Arc::new(move |data: TrackData| {
            sink.lock().unwrap().push(data);
        });
        (publisher, published)
    }

    fn controller<E: Engine>(
        engine: Arc<E>,
        settings: ControllerSettings,
        cpu: u32,
    ) -> (TrackController<E>, Published) {
        let (publisher, published) = recorder();
        let controller = TrackController::new(
            format!("cpu{cpu}"),
            CpuSliceConfig { cpu },
            settings,
            engine,
            publisher,
        );
        (controller, published)
    }

    fn summarize_at(threshold: f64) -> ControllerSettings {
        ControllerSettings {
            summarize_threshold: threshold,
            ..Default::default()
        }
    }

    fn last(published: &Published) -> TrackData {
        published.lock().unwrap().last().cloned().unwrap()
    }

    async fn table_count(engine: &DataFusionEngine) -> usize {
        engine
            .execute("SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'")
            .await
            .unwrap()
            .iter()
            .map(|batch| batch.num_rows())
            .sum()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    /// Wraps an engine to record every query, optionally hold queries until
    /// released, and fail queries containing a pattern.
    struct RecordingEngine {
        inner: DataFusionEngine,
        queries: Mutex<Vec<String>>,
        gate: Option<Semaphore>,
        entered: Notify,
        fail_on: Mutex<Vec<String>>,
    }

    impl RecordingEngine {
        fn new(inner: DataFusionEngine) -> Self {
            Self {
                inner,
                queries: Mutex::default(),
                gate: None,
                entered: Notify::new(),
                fail_on: Mutex::default(),
            }
        }

        fn gated(inner: DataFusionEngine) -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::new(inner)
            }
        }

        fn open(&self) {
            if let Some(gate) = &self.gate {
                gate.add_permits(1_000);
            }
        }

        fn fail_on(&self, patterns: &[&str]) {
            *self.fail_on.lock().unwrap() = patterns.iter().map(|p| p.to_string()).collect();
        }

        fn queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.queries()
                .iter()
                .filter(|query| query.starts_with(prefix))
                .count()
        }
    }

    impl Engine for RecordingEngine {
        fn query(&self, sql: &str) -> impl Future<Output = QueryResult> + Send {
            async move {
                self.queries.lock().unwrap().push(sql.to_string());
                self.entered.notify_one();
                if let Some(gate) = &self.gate {
                    gate.acquire().await.unwrap().forget();
                }
                let fail = self
                    .fail_on
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|pattern| sql.contains(pattern.as_str()));
                if fail {
                    return QueryResult::error("injected failure");
                }
                self.inner.query(sql).await
            }
        }
    }

    #[tokio::test]
    async fn test_slices_end_to_end() {
        let engine = Arc::new(engine(&example_slices()));
        let (controller, published) = controller(engine, ControllerSettings::default(), 0);
        let refresh = controller
            .refresh(TimeWindow::new(0.0, 1.0, 1e-10))
            .await
            .unwrap();
        assert_eq!(refresh, Refresh::Published(DataKind::Slice));

        let data = last(&published);
        let slices = data.as_slices().unwrap();
        assert_eq!(slices.length, 2);
        assert_eq!(slices.ids, vec![1, 2]);
        assert_eq!(slices.utids, vec![1, 2]);
        assert_close(slices.starts[0], 0.0);
        assert_close(slices.starts[1], 0.6);
        assert_close(slices.ends[0], 0.5);
        assert_close(slices.ends[1], 0.7);
        assert_eq!(slices.start, 0.0);
        assert_eq!(slices.end, 1.0);
        assert_eq!(controller.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_summary_end_to_end() {
        let engine = Arc::new(engine(&example_slices()));
        let (controller, published) = controller(engine, summarize_at(1e-8), 0);
        let refresh = controller
            .refresh(TimeWindow::new(0.0, 1.0, 1e-7))
            .await
            .unwrap();
        assert_eq!(refresh, Refresh::Published(DataKind::Summary));

        let data = last(&published);
        let summary = data.as_summary().unwrap();
        assert_close(summary.bucket_size_seconds, 1e-6);
        assert_eq!(summary.utilizations.len(), 1_000_000);
        assert_eq!(summary.length, 600_000);
        let active: f64 = summary
            .utilizations
            .iter()
            .map(|utilization| utilization * summary.bucket_size_seconds)
            .sum();
        assert!((active - 0.6).abs() < 1e-6, "active {active}");
        assert!(
            summary
                .utilizations
                .iter()
                .all(|utilization| (0.0..=1.0 + 1e-9).contains(utilization))
        );
        assert_eq!(summary.utilizations[0], 1.0);
        assert_eq!(summary.utilizations[550_000], 0.0);
        assert_eq!(summary.utilizations[650_000], 1.0);
    }

    #[tokio::test]
    async fn test_threshold_switches_output() {
        let engine = Arc::new(engine(&example_slices()));
        let (controller, published) = controller(engine, summarize_at(0.001), 0);

        let refresh = controller
            .refresh(TimeWindow::new(0.0, 1.0, 0.000_999))
            .await
            .unwrap();
        assert_eq!(refresh, Refresh::Published(DataKind::Slice));

        let refresh = controller
            .refresh(TimeWindow::new(0.0, 1.0, 0.001))
            .await
            .unwrap();
        assert_eq!(refresh, Refresh::Published(DataKind::Summary));

        // 10ms buckets: 50 busy from the first slice, 10 from the second
        let data = last(&published);
        let summary = data.as_summary().unwrap();
        assert_eq!(summary.utilizations.len(), 100);
        assert_eq!(summary.length, 60);
        let busy = summary
            .utilizations
            .iter()
            .filter(|utilization| **utilization > 0.0)
            .count();
        assert_eq!(busy, summary.length);
        for (bucket, utilization) in summary.utilizations.iter().enumerate() {
            let expected = if bucket < 50 || (60..70).contains(&bucket) {
                1.0
            } else {
                0.0
            };
            assert_close(*utilization, expected);
        }
    }

    #[tokio::test]
    async fn test_summary_start_aligned_to_bucket() {
        let engine = Arc::new(engine(&example_slices()));
        let (controller, published) = controller(engine, summarize_at(0.001), 0);
        controller
            .refresh(TimeWindow::new(0.105, 1.0, 0.001))
            .await
            .unwrap();
        let data = last(&published);
        let summary = data.as_summary().unwrap();
        assert_close(summary.start, 0.1);
        assert_eq!(summary.end, 1.0);
        assert_eq!(summary.utilizations.len(), 90);
        // bucket 0 is [100ms, 110ms), fully inside the first slice
        assert_close(summary.utilizations[0], 1.0);
    }

    #[tokio::test]
    async fn test_slice_truncation() {
        let slices = [
            slice(1, 0, 100 * MS, 0, 1),
            slice(2, 200 * MS, 100 * MS, 0, 1),
            slice(3, 400 * MS, 100 * MS, 0, 1),
        ];
        let engine = Arc::new(engine(&slices));
        let window = TimeWindow::new(0.0, 1.0, 1e-6);

        let settings = ControllerSettings {
            slice_limit: 2,
            ..Default::default()
        };
        let (truncated, published) = controller(engine.clone(), settings, 0);
        truncated.refresh(window).await.unwrap();
        let data = last(&published);
        let slices = data.as_slices().unwrap();
        assert_eq!(slices.length, 2);
        assert_eq!(slices.ids, vec![1, 2]);
        assert_eq!(slices.end, slices.ends[1]);
        assert_close(slices.end, 0.3);

        let (complete, published) = controller(engine, ControllerSettings::default(), 0);
        complete.refresh(window).await.unwrap();
        let data = last(&published);
        let slices = data.as_slices().unwrap();
        assert_eq!(slices.length, 3);
        assert_eq!(slices.end, 1.0);
        for (start, end) in slices.starts.iter().zip(&slices.ends) {
            assert!(start <= end);
        }
    }

    #[tokio::test]
    async fn test_summary_row_cap_keeps_end() {
        let engine = Arc::new(engine(&example_slices()));
        let settings = ControllerSettings {
            summarize_threshold: 0.001,
            summary_limit: 1,
            ..Default::default()
        };
        let (controller, published) = controller(engine, settings, 0);
        controller
            .refresh(TimeWindow::new(0.0, 1.0, 0.001))
            .await
            .unwrap();
        let data = last(&published);
        let summary = data.as_summary().unwrap();
        assert_eq!(summary.length, 1);
        assert_eq!(summary.utilizations.len(), 100);
        assert_eq!(summary.end, 1.0);
    }

    #[tokio::test]
    async fn test_partition_and_idle_filtered() {
        let slices = [
            slice(1, 0, 100 * MS, 0, 1),
            slice(2, 100 * MS, 100 * MS, 0, 0),
            slice(3, 50 * MS, 100 * MS, 1, 3),
        ];
        let engine = Arc::new(engine(&slices));
        let window = TimeWindow::new(0.0, 1.0, 1e-6);

        let (cpu0, published0) = controller(engine.clone(), ControllerSettings::default(), 0);
        let (cpu1, published1) = controller(engine, ControllerSettings::default(), 1);
        assert_ne!(cpu0.scaffold_names(), cpu1.scaffold_names());
        let (a, b) = tokio::join!(cpu0.refresh(window), cpu1.refresh(window));
        a.unwrap();
        b.unwrap();

        let data = last(&published0);
        assert_eq!(data.as_slices().unwrap().ids, vec![1]);
        let data = last(&published1);
        let slices = data.as_slices().unwrap();
        assert_eq!(slices.ids, vec![3]);
        assert_eq!(slices.utids, vec![3]);
    }

    #[tokio::test]
    async fn test_slices_clipped_to_window() {
        let engine = Arc::new(engine(&[slice(1, 500 * MS, 1_000 * MS, 0, 1)]));
        let (controller, published) = controller(engine, ControllerSettings::default(), 0);
        controller
            .refresh(TimeWindow::new(1.0, 2.0, 1e-6))
            .await
            .unwrap();
        let data = last(&published);
        let slices = data.as_slices().unwrap();
        assert_eq!(slices.length, 1);
        assert_close(slices.start, 1.0);
        assert_close(slices.starts[0], 1.0);
        assert_close(slices.ends[0], 1.5);
    }

    #[tokio::test]
    async fn test_bounds_change_dropped_while_busy() {
        let engine = Arc::new(RecordingEngine::gated(engine(&example_slices())));
        let (controller, published) = controller(engine.clone(), ControllerSettings::default(), 0);

        let first = controller.on_bounds_change(TimeWindow::new(0.0, 1.0, 1e-6));
        assert!(first.is_started());
        engine.entered.notified().await;
        let issued = engine.queries().len();
        assert_eq!(issued, 1);
        assert_eq!(controller.phase(), Phase::Fetching);

        let second = controller.on_bounds_change(TimeWindow::new(0.5, 1.5, 1e-6));
        assert!(matches!(second, BoundsChange::Dropped));
        let refresh = controller
            .refresh(TimeWindow::new(0.5, 1.5, 1e-6))
            .await
            .unwrap();
        assert_eq!(refresh, Refresh::Dropped);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.queries().len(), issued);

        engine.open();
        first.wait().await;
        assert_eq!(controller.phase(), Phase::Idle);
        let published = published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].as_slices().unwrap().end, 1.0);
    }

    #[tokio::test]
    async fn test_destroy_before_setup_issues_nothing() {
        let engine = Arc::new(RecordingEngine::new(engine(&example_slices())));
        let (controller, published) = controller(engine.clone(), ControllerSettings::default(), 0);
        controller.destroy().await.unwrap();
        controller.destroy().await.unwrap();
        controller.on_destroy().await.unwrap();
        assert!(engine.queries().is_empty());
        assert_eq!(controller.phase(), Phase::Destroyed);

        let change = controller.on_bounds_change(TimeWindow::new(0.0, 1.0, 1e-6));
        assert!(matches!(change, BoundsChange::Rejected));
        let refresh = controller
            .refresh(TimeWindow::new(0.0, 1.0, 1e-6))
            .await
            .unwrap();
        assert_eq!(refresh, Refresh::Destroyed);
        assert!(engine.queries().is_empty());
        assert!(published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_drops_relations_once() {
        let engine = Arc::new(RecordingEngine::new(engine(&example_slices())));
        let (controller, _published) = controller(engine.clone(), ControllerSettings::default(), 0);
        controller
            .refresh(TimeWindow::new(0.0, 1.0, 1e-6))
            .await
            .unwrap();
        assert_eq!(engine.count("CREATE OR REPLACE TABLE"), 1);
        assert_eq!(engine.count("CREATE OR REPLACE VIEW"), 1);

        controller.destroy().await.unwrap();
        controller.on_destroy().await.unwrap();
        controller.destroy().await.unwrap();
        assert_eq!(engine.count("DROP VIEW"), 1);
        assert_eq!(engine.count("DROP TABLE"), 1);

        let names = controller.scaffold_names();
        assert_eq!(
            table_count(&engine.inner).await,
            1,
            "{} or {} still registered",
            names.window,
            names.span
        );
    }

    #[tokio::test]
    async fn test_destroy_during_fetch_skips_publish() {
        let engine = Arc::new(RecordingEngine::gated(engine(&example_slices())));
        let (controller, published) = controller(engine.clone(), ControllerSettings::default(), 0);

        let fetch = controller.on_bounds_change(TimeWindow::new(0.0, 1.0, 1e-6));
        engine.entered.notified().await;
        let destroy = controller.on_destroy();
        assert_eq!(controller.phase(), Phase::Destroyed);

        engine.open();
        fetch.wait().await;
        destroy.await.unwrap();
        assert!(published.lock().unwrap().is_empty());
        assert_eq!(engine.count("DROP VIEW"), 1);
        assert_eq!(engine.count("DROP TABLE"), 1);
        assert_eq!(controller.phase(), Phase::Destroyed);
    }

    #[tokio::test]
    async fn test_failed_fetch_stays_fetchable() {
        let engine = Arc::new(RecordingEngine::new(engine(&example_slices())));
        let (controller, published) = controller(engine.clone(), ControllerSettings::default(), 0);
        let window = TimeWindow::new(0.0, 1.0, 1e-6);

        engine.fail_on(&["SELECT ts"]);
        let err = controller.refresh(window).await.unwrap_err();
        assert!(err.is_query_error());
        assert_eq!(controller.phase(), Phase::Idle);
        assert!(published.lock().unwrap().is_empty());

        // spawned fetches log the failure and still release the phase
        let change = controller.on_bounds_change(window);
        assert!(change.is_started());
        change.wait().await;
        assert_eq!(controller.phase(), Phase::Idle);

        engine.fail_on(&[]);
        let refresh = controller.refresh(window).await.unwrap();
        assert_eq!(refresh, Refresh::Published(DataKind::Slice));
        assert_eq!(engine.count("CREATE OR REPLACE TABLE"), 1);
        assert_eq!(published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_setup_is_retried() {
        let engine = Arc::new(RecordingEngine::new(engine(&example_slices())));
        let (controller, _published) = controller(engine.clone(), ControllerSettings::default(), 0);
        let window = TimeWindow::new(0.0, 1.0, 1e-6);

        engine.fail_on(&["CREATE OR REPLACE VIEW"]);
        assert!(controller.refresh(window).await.is_err());
        assert_eq!(controller.phase(), Phase::Uninitialized);
        assert_eq!(engine.count("DROP TABLE"), 1);

        engine.fail_on(&[]);
        let refresh = controller.refresh(window).await.unwrap();
        assert_eq!(refresh, Refresh::Published(DataKind::Slice));
        assert_eq!(engine.count("CREATE OR REPLACE TABLE"), 2);
        assert_eq!(controller.phase(), Phase::Idle);
        controller.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_recovers_after_failed_cleanup() {
        let engine = Arc::new(RecordingEngine::new(engine(&example_slices())));
        let (controller, published) = controller(engine.clone(), ControllerSettings::default(), 0);
        let window = TimeWindow::new(0.0, 1.0, 1e-6);

        // the view fails and so does dropping the half-built window
        engine.fail_on(&["CREATE OR REPLACE VIEW", "DROP TABLE"]);
        assert!(controller.refresh(window).await.is_err());
        assert_eq!(controller.phase(), Phase::Uninitialized);
        assert_eq!(table_count(&engine.inner).await, 2);

        engine.fail_on(&[]);
        for _ in 0..2 {
            let refresh = controller.refresh(window).await.unwrap();
            assert_eq!(refresh, Refresh::Published(DataKind::Slice));
        }
        assert_eq!(engine.count("CREATE OR REPLACE TABLE"), 2);
        assert_eq!(published.lock().unwrap().len(), 2);

        controller.destroy().await.unwrap();
        assert_eq!(table_count(&engine.inner).await, 1);
    }

    #[tokio::test]
    async fn test_dropped_controller_releases_relations() {
        let engine = Arc::new(engine(&example_slices()));
        let (controller, published) = controller(engine.clone(), ControllerSettings::default(), 0);
        controller
            .refresh(TimeWindow::new(0.0, 1.0, 1e-6))
            .await
            .unwrap();
        assert_eq!(published.lock().unwrap().len(), 1);
        assert_eq!(table_count(&engine).await, 3);

        drop(controller);
        for _ in 0..200 {
            if table_count(&engine).await == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("relations of a dropped controller were never released");
    }

    #[tokio::test]
    async fn test_registry_tracks_share_engine() {
        let mut slices = example_slices();
        slices.push(slice(3, 100 * MS, 300 * MS, 1, 7));
        let engine = Arc::new(engine(&slices));
        let settings = Settings::parse(
            r#"
            [[tracks]]
            id = "cpu0"
            kind = "cpu_slices"
            config = { cpu = 0 }

            [[tracks]]
            id = "cpu1"
            kind = "cpu_slices"
            config = { cpu = 1 }
            "#,
        )
        .unwrap();
        let registry = Registry::new(settings.controller.clone());
        let published = Arc::new(Mutex::new(Vec::<(String, TrackData)>::new()));
        let tracks = settings
            .tracks
            .iter()
            .map(|spec| {
                let sink = published.clone();
                let id = spec.id.clone();
                let publisher: Arc<dyn Publish> = Arc::new(move |data: TrackData| {
                    sink.lock().unwrap().push((id.clone(), data));
                });
                registry.create(spec, engine.clone(), publisher).unwrap()
            })
            .collect::<Vec<_>>();

        let window = TimeWindow::new(0.0, 1.0, 1e-6);
        let changes = tracks
            .iter()
            .map(|track| track.on_bounds_change(window))
            .collect::<Vec<_>>();
        for change in changes {
            change.wait().await;
        }
        for track in &tracks {
            track.on_destroy().await.unwrap();
            assert_eq!(track.phase(), Phase::Destroyed);
        }

        let mut published = published.lock().unwrap().clone();
        published.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "cpu0");
        assert_eq!(published[0].1.as_slices().unwrap().ids, vec![1, 2]);
        assert_eq!(published[1].0, "cpu1");
        assert_eq!(published[1].1.as_slices().unwrap().utids, vec![7]);

        assert_eq!(table_count(&engine).await, 1);
    }

    #[tokio::test]
    async fn test_csv_events() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sched.csv");
        std::fs::write(
            &path,
            "row_id,ts,dur,cpu,utid\n1,0,500000000,0,1\n2,600000000,100000000,0,2\n",
        )
        .unwrap();
        let engine = DataFusionEngine::new().unwrap();
        engine.register_csv("sched", &path).await.unwrap();
        let (controller, published) = controller(Arc::new(engine), ControllerSettings::default(), 0);
        controller
            .refresh(TimeWindow::new(0.0, 1.0, 1e-10))
            .await
            .unwrap();
        let data = last(&published);
        let slices = data.as_slices().unwrap();
        assert_eq!(slices.ids, vec![1, 2]);
        assert_eq!(slices.utids, vec![1, 2]);
        assert_close(slices.ends[1], 0.7);
    }
}
