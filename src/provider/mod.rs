//! The remote imagery provider as seen by the orchestrators.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ProviderError;
use crate::record::AssetKey;

pub mod planet;

pub use planet::PlanetClient;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub point: Point,
    pub dates: DateRange,
    pub item_type: String,
    /// Percent, 0-100.
    pub max_cloud_cover: f64,
}

/// A scene returned by a search.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub id: String,
    pub item_type: String,
    pub acquired: Option<DateTime<Utc>>,
    /// Percent, 0-100.
    pub cloud_cover: f64,
    pub asset_types: Vec<String>,
    /// Raw provider properties, kept for the metadata document.
    pub properties: serde_json::Value,
}

impl Scene {
    pub fn offers(&self, asset_type: &str) -> bool {
        self.asset_types.iter().any(|a| a == asset_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Accepted,
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Inactive,
    Activating,
    Active,
}

/// How to treat a `.partial` file left behind by an interrupted transfer.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResumePolicy {
    /// Continue from the partial file's length with a `Range` request.
    #[default]
    Range,
    /// Always start over from byte zero.
    Restart,
}

/// What the provider reported about a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReceipt {
    /// Length of the file on disk after the transfer, including resumed bytes.
    pub bytes_on_disk: u64,
    pub expected_size: Option<u64>,
    /// Hex md5 digest advertised by the provider.
    pub md5: Option<String>,
}

/// Rate limiting and transient failures are retried inside the implementation;
/// an `Err(ProviderError::RateLimited)` means the retry budget ran out.
pub trait ImageryProvider {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Scene>, ProviderError>;

    async fn request_activation(
        &self,
        item_type: &str,
        key: &AssetKey,
    ) -> Result<Activation, ProviderError>;

    async fn poll_status(&self, item_type: &str, key: &AssetKey)
        -> Result<PollStatus, ProviderError>;

    async fn download(
        &self,
        item_type: &str,
        key: &AssetKey,
        destination: &Path,
        resume: ResumePolicy,
    ) -> Result<DownloadReceipt, ProviderError>;
}
