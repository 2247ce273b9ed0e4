//! Drives records from `Discovered` to `Active`.
//!
//! A pass touches every record in an activation-phase state exactly once and persists
//! each record as soon as it changes, so interrupting a pass loses at most the record in
//! flight. Waiting for the provider is done by running another pass later, never by
//! sleeping here.

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::error::ProviderError;
use crate::provider::{Activation, ImageryProvider, PollStatus, Scene};
use crate::record::{AssetKey, AssetRecord, AssetState};
use crate::status_store::StatusStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub requested: usize,
    pub activating: usize,
    pub activated: usize,
    pub failed: usize,
    /// Left as they were because of rate limiting or a transient failure.
    pub deferred: usize,
}

pub struct ActivationOrchestrator<'a, P: ImageryProvider> {
    provider: &'a P,
    store: &'a StatusStore,
    timeout: Duration,
    /// Used for records written before the item type was tracked.
    default_item_type: String,
}

impl<'a, P: ImageryProvider> ActivationOrchestrator<'a, P> {
    pub fn new(provider: &'a P, store: &'a StatusStore, timeout: Duration, default_item_type: &str) -> Self {
        Self {
            provider,
            store,
            timeout,
            default_item_type: default_item_type.to_string(),
        }
    }

    /// Create `Discovered` records for scene/asset pairs the store does not know yet.
    /// Scenes over the cloud cover limit never get a record.
    pub fn register(
        &self,
        scenes: &[Scene],
        asset_types: &[String],
        max_cloud_cover: f64,
    ) -> Result<Vec<AssetKey>> {
        let known = self.store.load()?;
        let mut created = vec![];

        for scene in scenes {
            if scene.cloud_cover > max_cloud_cover {
                info!(
                    scene = %scene.id,
                    "Skipping scene with {:.1}% cloud cover (limit {:.1}%)",
                    scene.cloud_cover,
                    max_cloud_cover
                );
                continue;
            }
            for asset_type in asset_types {
                let key = AssetKey::new(&scene.id, asset_type);
                if known.contains_key(&key.to_string()) {
                    continue;
                }
                if !scene.offers(asset_type) {
                    warn!(scene = %scene.id, "Asset type '{}' not available for scene", asset_type);
                    continue;
                }
                let record = AssetRecord::discovered(
                    &key,
                    &scene.item_type,
                    scene.acquired,
                    scene.cloud_cover,
                    Utc::now(),
                );
                self.store.upsert(&record)?;
                info!(asset = %key, "Discovered");
                created.push(key);
            }
        }
        Ok(created)
    }

    pub async fn run_pass(&self) -> Result<ActivationReport> {
        let pending: Vec<AssetRecord> = self
            .store
            .load()?
            .into_values()
            .filter(|r| r.state.is_activation_phase())
            .collect();

        let mut report = ActivationReport::default();
        for record in pending {
            self.step(record, &mut report).await?;
        }
        Ok(report)
    }

    async fn step(&self, mut record: AssetRecord, report: &mut ActivationReport) -> Result<()> {
        let key = record.key();
        let item_type = if record.item_type.is_empty() {
            self.default_item_type.clone()
        } else {
            record.item_type.clone()
        };
        let now = Utc::now();

        match record.state {
            AssetState::Discovered => {
                match self.provider.request_activation(&item_type, &key).await {
                    Ok(outcome) => {
                        record.advance(AssetState::ActivationRequested, now)?;
                        report.requested += 1;
                        match outcome {
                            Activation::Accepted => info!(asset = %key, "Activation requested"),
                            Activation::AlreadyActive => info!(asset = %key, "Provider reports asset already active"),
                        }
                    }
                    Err(e) => {
                        if !self.absorb(&mut record, e, report)? {
                            return Ok(());
                        }
                    }
                }
            }
            AssetState::ActivationRequested | AssetState::Activating => {
                let polled = self.provider.poll_status(&item_type, &key).await;
                record.mark_checked(now);
                let expired = record.activation_expired(now, self.timeout);
                match polled {
                    Ok(PollStatus::Active) => {
                        record.advance(AssetState::Active, now)?;
                        report.activated += 1;
                        info!(asset = %key, "Active and ready for download");
                    }
                    Ok(PollStatus::Inactive) => {
                        warn!(asset = %key, "Provider reports asset inactive");
                        record.fail("provider reports asset inactive", now)?;
                        report.failed += 1;
                    }
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    _ if expired => {
                        let reason = format!(
                            "activation did not complete within {} minutes",
                            self.timeout.num_minutes()
                        );
                        warn!(asset = %key, "{}", reason);
                        record.fail(reason, now)?;
                        report.failed += 1;
                    }
                    Ok(PollStatus::Activating) => {
                        record.advance(AssetState::Activating, now)?;
                        report.activating += 1;
                        info!(asset = %key, "Still activating");
                    }
                    Err(e) => {
                        self.absorb(&mut record, e, report)?;
                    }
                }
            }
            _ => return Ok(()),
        }

        self.store.upsert(&record)?;
        Ok(())
    }

    /// Fatal errors propagate; asset-terminal errors fail the record; anything else
    /// defers the record to a later pass. Returns whether the record changed.
    fn absorb(
        &self,
        record: &mut AssetRecord,
        error: ProviderError,
        report: &mut ActivationReport,
    ) -> Result<bool> {
        let key = record.key();
        if error.is_fatal() {
            return Err(error.into());
        }
        if error.is_asset_terminal() {
            warn!(asset = %key, "Giving up: {}", error);
            record.fail(error.to_string(), Utc::now())?;
            report.failed += 1;
            return Ok(true);
        }
        warn!(asset = %key, "Deferred to next run: {}", error);
        report.deferred += 1;
        Ok(false)
    }
}
