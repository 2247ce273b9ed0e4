//! Scripted provider and converter used by the orchestrator tests.

use chrono::{TimeZone, Utc};
use serde_json::json;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use crate::convert::Converter;
use crate::error::{ConvertError, ProviderError};
use crate::provider::{
    Activation, DownloadReceipt, ImageryProvider, PollStatus, ResumePolicy, Scene, SearchRequest,
};
use crate::record::AssetKey;

pub const PAYLOAD: &[u8] = b"II*\0fake raster payload";

pub fn scene(id: &str, cloud_cover: f64) -> Scene {
    Scene {
        id: id.to_string(),
        item_type: "PSScene".to_string(),
        acquired: Some(Utc.with_ymd_and_hms(2024, 6, 5, 18, 30, 0).unwrap()),
        cloud_cover,
        asset_types: vec!["basic_analytic_8b".to_string(), "ortho_visual".to_string()],
        properties: json!({
            "acquired": "2024-06-05T18:30:00Z",
            "cloud_cover": cloud_cover / 100.0,
            "item_type": "PSScene"
        }),
    }
}

pub enum DownloadScript {
    /// Writes the payload and reports its size and md5.
    Complete,
    /// Writes the payload but claims the object is larger.
    Truncated,
    /// Writes the payload with a digest that does not match.
    Corrupted,
    Fail(ProviderError),
}

/// Pops scripted responses per asset key, falling back to the happy path when a queue
/// is empty. Every call is recorded as `"<op> <key>"`.
#[derive(Default)]
pub struct ScriptedProvider {
    pub scenes: Vec<Scene>,
    activations: RefCell<HashMap<String, VecDeque<Result<Activation, ProviderError>>>>,
    polls: RefCell<HashMap<String, VecDeque<Result<PollStatus, ProviderError>>>>,
    downloads: RefCell<HashMap<String, VecDeque<DownloadScript>>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedProvider {
    pub fn with_scenes(scenes: Vec<Scene>) -> Self {
        Self {
            scenes,
            ..Self::default()
        }
    }

    pub fn push_activation(&self, key: &str, response: Result<Activation, ProviderError>) {
        self.activations
            .borrow_mut()
            .entry(key.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn push_poll(&self, key: &str, response: Result<PollStatus, ProviderError>) {
        self.polls
            .borrow_mut()
            .entry(key.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn push_download(&self, key: &str, script: DownloadScript) {
        self.downloads
            .borrow_mut()
            .entry(key.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn calls_matching(&self, op: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    fn record(&self, op: &str, key: &AssetKey) {
        self.calls.borrow_mut().push(format!("{} {}", op, key));
    }
}

impl ImageryProvider for ScriptedProvider {
    async fn search(&self, _request: &SearchRequest) -> Result<Vec<Scene>, ProviderError> {
        self.calls.borrow_mut().push("search".to_string());
        Ok(self.scenes.clone())
    }

    async fn request_activation(
        &self,
        _item_type: &str,
        key: &AssetKey,
    ) -> Result<Activation, ProviderError> {
        self.record("activate", key);
        self.activations
            .borrow_mut()
            .get_mut(&key.to_string())
            .and_then(|q| q.pop_front())
            .unwrap_or(Ok(Activation::Accepted))
    }

    async fn poll_status(&self, _item_type: &str, key: &AssetKey) -> Result<PollStatus, ProviderError> {
        self.record("poll", key);
        self.polls
            .borrow_mut()
            .get_mut(&key.to_string())
            .and_then(|q| q.pop_front())
            .unwrap_or(Ok(PollStatus::Activating))
    }

    async fn download(
        &self,
        _item_type: &str,
        key: &AssetKey,
        destination: &Path,
        _resume: ResumePolicy,
    ) -> Result<DownloadReceipt, ProviderError> {
        self.record("download", key);
        let script = self
            .downloads
            .borrow_mut()
            .get_mut(&key.to_string())
            .and_then(|q| q.pop_front())
            .unwrap_or(DownloadScript::Complete);

        let digest = format!("{:x}", md5::compute(PAYLOAD));
        let (expected_size, md5) = match script {
            DownloadScript::Fail(e) => return Err(e),
            DownloadScript::Complete => (PAYLOAD.len() as u64, digest),
            DownloadScript::Truncated => (PAYLOAD.len() as u64 + 100, digest),
            DownloadScript::Corrupted => (PAYLOAD.len() as u64, "0".repeat(32)),
        };

        let io = |source: std::io::Error| ProviderError::Io {
            path: destination.to_path_buf(),
            source,
        };
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }
        fs::write(destination, PAYLOAD).map_err(io)?;

        Ok(DownloadReceipt {
            bytes_on_disk: PAYLOAD.len() as u64,
            expected_size: Some(expected_size),
            md5: Some(md5),
        })
    }
}

/// Succeeds by copying the raw file unless a failure was queued.
#[derive(Default)]
pub struct ScriptedConverter {
    failures: RefCell<VecDeque<String>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedConverter {
    pub fn push_failure(&self, stderr: &str) {
        self.failures.borrow_mut().push_back(stderr.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl Converter for ScriptedConverter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn convert(&self, raw: &Path, output: &Path) -> Result<(), ConvertError> {
        self.calls.borrow_mut().push(raw.display().to_string());
        if let Some(stderr) = self.failures.borrow_mut().pop_front() {
            return Err(ConvertError::Failed {
                program: "scripted".to_string(),
                code: Some(1),
                stderr,
            });
        }
        fs::copy(raw, output).map_err(|source| ConvertError::Launch {
            program: "scripted".to_string(),
            source,
        })?;
        Ok(())
    }
}
