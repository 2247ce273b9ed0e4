use anyhow::{anyhow, bail, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::convert::ConvertSettings;
use crate::provider::planet::DEFAULT_BASE_URL;
use crate::provider::{ResumePolicy, SearchRequest};
use crate::retry::RetryPolicy;

/// Tunables read from an optional TOML file. Every key has a default.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub api_base_url: String,
    pub activation_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub download: DownloadSettings,
    pub convert: ConvertSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            activation_timeout_secs: 4 * 60 * 60,
            retry: RetryPolicy::default(),
            download: DownloadSettings::default(),
            convert: ConvertSettings::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DownloadSettings {
    /// Attempts per asset, counted across invocations.
    pub max_attempts: u32,
    pub resume: ResumePolicy,
    pub request_timeout_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            resume: ResumePolicy::Range,
            request_timeout_secs: 600,
        }
    }
}

impl Settings {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow!("Unable to read settings {}: {}", path.display(), e))?;
        let settings: Self = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults when no file is given; a file that was asked for must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(self: &Self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.download.max_attempts == 0 {
            bail!("download.max_attempts must be at least 1");
        }
        if self.activation_timeout_secs == 0 {
            bail!("activation_timeout_secs must be positive");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("retry.base_delay_ms exceeds retry.max_delay_ms");
        }
        Ok(())
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::seconds(self.activation_timeout_secs as i64)
    }
}

pub fn validate_search(request: &SearchRequest, asset_types: &[String]) -> Result<()> {
    if request.dates.end < request.dates.start {
        bail!(
            "End date {} is before start date {}",
            request.dates.end,
            request.dates.start
        );
    }
    if !(-90.0..=90.0).contains(&request.point.latitude) {
        bail!("Latitude {} is out of range", request.point.latitude);
    }
    if !(-180.0..=180.0).contains(&request.point.longitude) {
        bail!("Longitude {} is out of range", request.point.longitude);
    }
    if !(0.0..=100.0).contains(&request.max_cloud_cover) {
        bail!(
            "Max cloud cover {} must be a percentage between 0 and 100",
            request.max_cloud_cover
        );
    }
    if asset_types.is_empty() {
        bail!("At least one asset type is required");
    }
    if let Some(bad) = asset_types.iter().find(|a| a.is_empty() || a.contains(':')) {
        bail!("Invalid asset type '{}'", bad);
    }
    Ok(())
}
