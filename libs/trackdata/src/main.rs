use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use miette::IntoDiagnostic;
use tabled::builder::Builder;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trackdata::{
    CpuSliceConfig, DataFusionEngine, Publish, Registry, Settings, TimeWindow, TrackController,
    TrackData,
};

#[derive(Parser, Clone)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[clap(
        long,
        value_enum,
        global = true,
        default_value = "warn",
        help = "Log level (error, warn, info, debug, trace)"
    )]
    log_level: LogLevel,
}

#[derive(Subcommand, Clone)]
enum Commands {
    #[command(about = "Fetch one CPU track for a window and print the result")]
    Slices(SlicesArgs),
    #[command(about = "Fetch every track in a config file for a window")]
    Tracks(TracksArgs),
}

#[derive(clap::Args, Clone, Debug)]
struct WindowArgs {
    #[clap(long, help = "Window start in seconds")]
    start: f64,
    #[clap(long, help = "Window end in seconds")]
    end: f64,
    #[clap(long, help = "Seconds per pixel")]
    resolution: f64,
}

impl WindowArgs {
    fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start, self.end, self.resolution)
    }
}

#[derive(clap::Args, Clone, Debug)]
struct SlicesArgs {
    #[clap(help = "CSV of scheduling slices (row_id, ts, dur, cpu, utid)")]
    events: PathBuf,
    #[clap(long, help = "CPU to fetch")]
    cpu: u32,
    #[command(flatten)]
    window: WindowArgs,
    #[clap(long, help = "Path to the configuration file")]
    config: Option<PathBuf>,
    #[clap(long, help = "Print JSON instead of a table")]
    json: bool,
}

#[derive(clap::Args, Clone, Debug)]
struct TracksArgs {
    #[clap(help = "CSV of scheduling slices (row_id, ts, dur, cpu, utid)")]
    events: PathBuf,
    #[clap(long, help = "Path to the configuration file")]
    config: PathBuf,
    #[command(flatten)]
    window: WindowArgs,
    #[clap(long, help = "Print JSON instead of a table")]
    json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let args = Cli::parse();
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::builder().from_env_lossy()
    } else {
        EnvFilter::builder().parse_lossy(format!("trackdata={}", args.log_level.as_str()))
    };

    let _ = tracing_subscriber::fmt::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .with_writer(std::io::stderr)
        .try_init();

    match args.command {
        Commands::Slices(args) => slices(args).await,
        Commands::Tracks(args) => tracks(args).await,
    }
}

async fn load_engine(settings: &Settings, events: &Path) -> miette::Result<Arc<DataFusionEngine>> {
    let engine = DataFusionEngine::new().into_diagnostic()?;
    engine
        .register_csv(&settings.controller.event_table, events)
        .await
        .into_diagnostic()?;
    info!(path = ?events, table = %settings.controller.event_table, "loaded events");
    Ok(Arc::new(engine))
}

async fn slices(args: SlicesArgs) -> miette::Result<()> {
    let settings = Settings::load(args.config).into_diagnostic()?;
    let engine = load_engine(&settings, &args.events).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let publisher: Arc<dyn Publish> = Arc::new(move |data: TrackData| {
        let _ = tx.send(data);
    });
    let id = format!("cpu{}", args.cpu);
    let controller = TrackController::new(
        id.clone(),
        CpuSliceConfig { cpu: args.cpu },
        settings.controller.clone(),
        engine,
        publisher,
    );
    let refresh = controller
        .refresh(args.window.window())
        .await
        .into_diagnostic()?;
    info!(?refresh, "refreshed");
    controller.destroy().await.into_diagnostic()?;
    drop(controller);

    while let Some(data) = rx.recv().await {
        print_data(id.clone(), &data, args.json)?;
    }
    Ok(())
}

async fn tracks(args: TracksArgs) -> miette::Result<()> {
    let settings = Settings::load(Some(args.config)).into_diagnostic()?;
    if settings.tracks.is_empty() {
        return Err(miette::miette!("config defines no [[tracks]]"));
    }
    let engine = load_engine(&settings, &args.events).await?;
    let registry = Registry::new(settings.controller.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let tracks = settings
        .tracks
        .iter()
        .map(|spec| {
            let tx = tx.clone();
            let id = spec.id.clone();
            let publisher: Arc<dyn Publish> = Arc::new(move |data: TrackData| {
                let _ = tx.send((id.clone(), data));
            });
            registry.create(spec, engine.clone(), publisher)
        })
        .collect::<Result<Vec<_>, _>>()
        .into_diagnostic()?;
    drop(tx);

    let window = args.window.window();
    let changes: Vec<_> = tracks
        .iter()
        .map(|track| track.on_bounds_change(window))
        .collect();
    for change in changes {
        change.wait().await;
    }
    for track in &tracks {
        track.on_destroy().await.into_diagnostic()?;
    }
    drop(tracks);

    while let Some((id, data)) = rx.recv().await {
        print_data(id, &data, args.json)?;
    }
    Ok(())
}

fn print_data(label: String, data: &TrackData, json: bool) -> miette::Result<()> {
    if json {
        let value = serde_json::json!({ "track": label, "data": data });
        println!("{}", serde_json::to_string_pretty(&value).into_diagnostic()?);
        return Ok(());
    }
    let mut builder = Builder::default();
    match data {
        TrackData::Slice(slices) => {
            println!(
                "{label}: {} slices in [{}, {}]",
                slices.length, slices.start, slices.end
            );
            builder.push_record(["ID", "START", "END", "UTID"]);
            for i in 0..slices.length {
                builder.push_record([
                    slices.ids[i].to_string(),
                    format!("{:.9}", slices.starts[i]),
                    format!("{:.9}", slices.ends[i]),
                    slices.utids[i].to_string(),
                ]);
            }
        }
        TrackData::Summary(summary) => {
            println!(
                "{label}: {} busy buckets of {}s in [{}, {}]",
                summary.length, summary.bucket_size_seconds, summary.start, summary.end
            );
            builder.push_record(["BUCKET", "START", "UTILIZATION"]);
            for (i, utilization) in summary.utilizations.iter().enumerate() {
                if *utilization == 0.0 {
                    continue;
                }
                builder.push_record([
                    i.to_string(),
                    format!("{:.9}", summary.start + i as f64 * summary.bucket_size_seconds),
                    format!("{utilization:.3}"),
                ]);
            }
        }
    }
    let mut table = builder.build();
    table.with(tabled::settings::Style::rounded());
    println!("{table}");
    Ok(())
}
