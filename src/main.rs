//! `sp1k1_calc` binary.
//!
//! Reads upstream samples as JSON lines on stdin (or generates them with
//! `--simulate`) and writes every record update to stdout as a JSON line.
//! Logs go to stderr.
use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use serde::Serialize;
use sp1k1_calc::config::Settings;
use sp1k1_calc::ioc::Ioc;
use sp1k1_calc::record::{OutputRecords, Stamped};
use sp1k1_calc::signal::{JsonLinesSource, MockSignalSource, Sample, SignalSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "sp1k1_calc")]
#[command(about = "Soft IOC publishing SP1K1 mono energy, cff, bandwidth and grating", long_about = None)]
struct Cli {
    /// TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Record name prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Rhai calculation file
    #[arg(long)]
    calc_path: Option<PathBuf>,

    /// Absolute deadband applied to every input
    #[arg(long)]
    deadband: Option<f64>,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Print the served and watched PV names, then exit
    #[arg(long)]
    list_pvs: bool,

    /// Drive the inputs from a built-in motor sequence instead of stdin
    #[arg(long)]
    simulate: bool,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(prefix) = &self.prefix {
            settings.server.prefix = prefix.clone();
        }
        if let Some(path) = &self.calc_path {
            settings.calculation.path = path.clone();
        }
        if let Some(deadband) = self.deadband {
            settings.dispatch.deadband = deadband;
        }
        if let Some(level) = &self.log_level {
            settings.application.log_level = level.clone();
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if cli.list_pvs {
        list_pvs(&settings);
        return Ok(());
    }

    info!(
        "Starting {} with prefix {}",
        settings.application.name, settings.server.prefix
    );

    let ioc = Ioc::from_settings(settings).context("Failed to load calculation module")?;
    let records = ioc.records();
    let echoes = spawn_echoes(&records);

    let stats = if cli.simulate {
        let source = Arc::new(MockSignalSource::new());
        let names = ioc.settings().upstream.names().map(str::to_string);
        let connected = ioc
            .connect(source.as_ref())
            .await
            .context("Failed to connect to upstream signals")?;
        let driver = tokio::spawn(simulate(source, names));
        let stats = connected.run(shutdown_signal()).await?;
        driver.abort();
        stats
    } else {
        let source = JsonLinesSource::new(BufReader::new(tokio::io::stdin()));
        let connected = ioc
            .connect(&source as &dyn SignalSource)
            .await
            .context("Failed to connect to upstream signals")?;
        connected.run(shutdown_signal()).await?
    };

    for echo in echoes {
        echo.abort();
    }
    info!("Handled {} samples", stats.handled());
    Ok(())
}

fn list_pvs(settings: &Settings) {
    let records = OutputRecords::new(&settings.server.prefix);
    println!("Served:");
    for record in records.all() {
        let meta = record.metadata();
        println!(
            "  {:<32} {:<9} {:<4} {}",
            meta.name,
            meta.record_type.as_str(),
            meta.units.as_deref().unwrap_or(""),
            meta.description.as_deref().unwrap_or("")
        );
    }
    println!("Watched:");
    for name in settings.upstream.names() {
        println!("  {name}");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}

#[derive(Serialize)]
struct UpdateLine<'a, T> {
    pv: &'a str,
    value: &'a T,
    timestamp: chrono::DateTime<chrono::Utc>,
}

fn spawn_echoes(records: &Arc<OutputRecords>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_echo(records.energy.name().to_string(), records.energy.subscribe()),
        spawn_echo(records.cff.name().to_string(), records.cff.subscribe()),
        spawn_echo(
            records.bandwidth.name().to_string(),
            records.bandwidth.subscribe(),
        ),
        spawn_echo(
            records.grating.name().to_string(),
            records.grating.subscribe(),
        ),
    ]
}

fn spawn_echo<T>(name: String, mut rx: watch::Receiver<Stamped<T>>) -> JoinHandle<()>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let stamped = rx.borrow_and_update().clone();
            let line = UpdateLine {
                pv: &name,
                value: &stamped.value,
                timestamp: stamped.timestamp,
            };
            match serde_json::to_string(&line) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Failed to encode update for {}: {}", name, e),
            }
        }
    })
}

/// Step the four motors through a short fixed sequence, then close.
async fn simulate(source: Arc<MockSignalSource>, names: [String; 4]) {
    let [grating_pitch, mirror_pitch, exit_gap, grating_horizontal] = names;
    let mut steps: Vec<(&str, f64)> = vec![
        (grating_horizontal.as_str(), 12.5),
        (grating_pitch.as_str(), 0.8),
        (mirror_pitch.as_str(), 0.6),
        (exit_gap.as_str(), 25.0),
    ];
    for i in 1..=10 {
        steps.push((grating_pitch.as_str(), 0.8 + 0.02 * f64::from(i)));
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    for (name, value) in steps {
        ticker.tick().await;
        source.publish(name, Sample::now(value));
    }
    ticker.tick().await;
    source.close();
}
