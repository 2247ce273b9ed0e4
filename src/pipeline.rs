//! One invocation of the tool: discover, advance activations, download and convert.

use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::activation::{ActivationOrchestrator, ActivationReport};
use crate::config::Settings;
use crate::convert::Converter;
use crate::download::{DownloadOrchestrator, DownloadReport};
use crate::layout::OutputLayout;
use crate::provider::{ImageryProvider, SearchRequest};
use crate::status_store::StatusStore;
use crate::summary::StatusSummary;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// `None` re-evaluates what the store already tracks without searching.
    pub search: Option<SearchRequest>,
    pub item_type: String,
    pub asset_types: Vec<String>,
    pub output_dir: PathBuf,
    pub status_file: PathBuf,
    pub activate_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub discovered: usize,
    pub activation: ActivationReport,
    pub download: Option<DownloadReport>,
    pub summary: StatusSummary,
}

pub async fn run<P, C>(
    provider: &P,
    converter: &C,
    options: &RunOptions,
    settings: &Settings,
) -> Result<RunOutcome>
where
    P: ImageryProvider,
    C: Converter,
{
    fs::create_dir_all(&options.output_dir)?;
    let store = StatusStore::new(&options.status_file);
    let layout = OutputLayout::new(&options.output_dir);

    // Fails fast on a corrupt store, before anything is asked of the provider.
    StatusSummary::from_map(&store.load()?).log("Status before run");

    let activation = ActivationOrchestrator::new(
        provider,
        &store,
        settings.activation_timeout(),
        &options.item_type,
    );

    let mut outcome = RunOutcome::default();
    if let Some(request) = options.search.as_ref() {
        match provider.search(request).await {
            Ok(scenes) => {
                for scene in scenes.iter().filter(|s| s.cloud_cover <= request.max_cloud_cover) {
                    let path = layout.write_metadata(scene)?;
                    info!(scene = %scene.id, "Saved metadata to {}", path.display());
                }
                outcome.discovered = activation
                    .register(&scenes, &options.asset_types, request.max_cloud_cover)?
                    .len();
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!("Search failed, continuing with tracked assets: {}", e),
        }
    }

    outcome.activation = activation.run_pass().await?;
    info!("Activation pass: {:?}", outcome.activation);

    if options.activate_only {
        info!("Activation requests completed. Run again without --activate-only to download the assets.");
    } else {
        let mut downloads = DownloadOrchestrator::new(
            provider,
            converter,
            &store,
            &layout,
            &settings.download,
            &options.item_type,
        );
        if !settings.convert.enabled {
            downloads = downloads.without_conversion();
        }
        let report = downloads.run_pass().await?;
        info!("Download pass: {:?}", report);
        outcome.download = Some(report);
    }

    outcome.summary = StatusSummary::from_map(&store.load()?);
    outcome.summary.log("Status after run");
    Ok(outcome)
}
