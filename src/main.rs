use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use planet_fetch::config::{validate_search, Settings};
use planet_fetch::convert::GdalConverter;
use planet_fetch::credentials::{EnvSecret, SecretProvider};
use planet_fetch::pipeline::{self, RunOptions};
use planet_fetch::provider::{DateRange, PlanetClient, Point, SearchRequest};

const DEFAULT_LATITUDE: f64 = 37.355138;
const DEFAULT_LONGITUDE: f64 = -120.411734;

/// Activate, download and convert Planet Labs imagery for a point of interest.
///
/// Each run advances every tracked asset by at most one step and exits; run it again
/// (by hand or from a scheduler) until everything is converted.
#[derive(Parser, Debug)]
#[command(name = "planet-fetch", version, about, long_about = None)]
struct Cli {
    /// Start date (YYYY-MM-DD)
    #[arg(long, required_unless_present = "no_search")]
    start_date: Option<NaiveDate>,

    /// End date (YYYY-MM-DD)
    #[arg(long, required_unless_present = "no_search")]
    end_date: Option<NaiveDate>,

    #[arg(long, default_value_t = DEFAULT_LATITUDE, allow_negative_numbers = true)]
    latitude: f64,

    #[arg(long, default_value_t = DEFAULT_LONGITUDE, allow_negative_numbers = true)]
    longitude: f64,

    #[arg(long, default_value = "PSScene")]
    item_type: String,

    /// Asset types to fetch for every scene
    #[arg(long, num_args = 1.., default_values = ["basic_analytic_8b", "ortho_visual"])]
    asset_types: Vec<String>,

    /// Maximum cloud cover, percent
    #[arg(long, default_value_t = 30.0)]
    max_cloud_cover: f64,

    #[arg(long, default_value = "./planet_data")]
    output_dir: PathBuf,

    /// Only request activations and poll; never download
    #[arg(long)]
    activate_only: bool,

    /// Skip the search and only advance assets already in the status file
    #[arg(long)]
    no_search: bool,

    /// Optional TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Defaults to <output-dir>/planet_status.json
    #[arg(long)]
    status_file: Option<PathBuf>,

    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Defaults to <output-dir>/planet_fetch.log
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn run_options(self: &Self) -> Result<RunOptions> {
        let search = if self.no_search {
            None
        } else {
            let start = self.start_date.ok_or(anyhow!("--start-date is required"))?;
            let end = self.end_date.ok_or(anyhow!("--end-date is required"))?;
            let request = SearchRequest {
                point: Point {
                    latitude: self.latitude,
                    longitude: self.longitude,
                },
                dates: DateRange { start, end },
                item_type: self.item_type.clone(),
                max_cloud_cover: self.max_cloud_cover,
            };
            validate_search(&request, &self.asset_types)?;
            Some(request)
        };

        Ok(RunOptions {
            search,
            item_type: self.item_type.clone(),
            asset_types: self.asset_types.clone(),
            output_dir: self.output_dir.clone(),
            status_file: self
                .status_file
                .clone()
                .unwrap_or_else(|| self.output_dir.join("planet_status.json")),
            activate_only: self.activate_only,
        })
    }
}

fn init_logging(log_file: &Path) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(log_file)?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .init();
    Ok(())
}

async fn execute(cli: Cli) -> Result<()> {
    let options = cli.run_options()?;
    let settings = Settings::load(cli.config.as_deref())?;
    let api_key = EnvSecret::new(&cli.env_file).api_key()?;

    let client = PlanetClient::new(
        &api_key,
        &settings.api_base_url,
        settings.retry.clone(),
        Duration::from_secs(settings.download.request_timeout_secs),
    )?;
    let converter = GdalConverter::new(settings.convert.clone());

    let outcome = pipeline::run(&client, &converter, &options, &settings).await?;
    info!(
        "Run complete: {} newly discovered, {} of {} tracked assets resolved",
        outcome.discovered,
        outcome.summary.count(planet_fetch::record::AssetState::Converted)
            + outcome.summary.count(planet_fetch::record::AssetState::Failed),
        outcome.summary.total()
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = fs::create_dir_all(&cli.output_dir) {
        eprintln!("Unable to create {}: {}", cli.output_dir.display(), e);
        return ExitCode::FAILURE;
    }
    let log_file = cli
        .log_file
        .clone()
        .unwrap_or_else(|| cli.output_dir.join("planet_fetch.log"));
    if let Err(e) = init_logging(&log_file) {
        eprintln!("Unable to open log file {}: {}", log_file.display(), e);
        return ExitCode::FAILURE;
    }

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
