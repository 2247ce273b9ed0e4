//! Planet Data API v1 client.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    Activation, DownloadReceipt, ImageryProvider, PollStatus, ResumePolicy, Scene, SearchRequest,
};
use crate::error::ProviderError;
use crate::record::AssetKey;
use crate::retry::{retry_transient, RetryPolicy};

pub const DEFAULT_BASE_URL: &str = "https://api.planet.com/data/v1";

const API_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize, Debug, Clone)]
struct AssetEntry {
    status: String,
    location: Option<String>,
    md5_digest: Option<String>,
    #[serde(rename = "_links", default)]
    links: AssetLinks,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct AssetLinks {
    activate: Option<String>,
}

pub struct PlanetClient {
    http: Client,
    api_key: String,
    base_url: Url,
    retry: RetryPolicy,
    download_timeout: Duration,
}

impl PlanetClient {
    pub fn new(
        api_key: &str,
        base_url: &str,
        retry: RetryPolicy,
        download_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        // Url::join drops the last path segment unless the base ends with '/'.
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).map_err(|e| ProviderError::Decode(format!("{}: {}", base, e)))?;
        let http = Client::builder()
            .user_agent(concat!("planet-fetch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            base_url,
            retry,
            download_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| ProviderError::Decode(format!("{}: {}", path, e)))
    }

    fn assets_url(&self, item_type: &str, scene_id: &str) -> Result<Url, ProviderError> {
        self.endpoint(&format!("item-types/{}/items/{}/assets", item_type, scene_id))
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .basic_auth(&self.api_key, Some(""))
            .timeout(API_TIMEOUT)
    }

    async fn fetch_asset(&self, item_type: &str, key: &AssetKey) -> Result<AssetEntry, ProviderError> {
        let url = &self.assets_url(item_type, &key.scene_id)?;
        let mut assets: HashMap<String, AssetEntry> =
            retry_transient(&self.retry, &format!("status {}", key), || async move {
                let response = check(self.authed(self.http.get(url.clone())).send().await?).await?;
                response
                    .json::<HashMap<String, AssetEntry>>()
                    .await
                    .map_err(|e| ProviderError::Decode(e.to_string()))
            })
            .await?;
        assets
            .remove(&key.asset_type)
            .ok_or_else(|| ProviderError::NotFound(key.to_string()))
    }

    async fn search_page(&self, url: Url, body: Option<&Value>) -> Result<Value, ProviderError> {
        let url = &url;
        retry_transient(&self.retry, "search", || async move {
            let builder = match body {
                Some(body) => self.http.post(url.clone()).json(body),
                None => self.http.get(url.clone()),
            };
            let response = check(self.authed(builder).send().await?).await?;
            response
                .json::<Value>()
                .await
                .map_err(|e| ProviderError::Decode(e.to_string()))
        })
        .await
    }

    async fn transfer(
        &self,
        location: &Url,
        destination: &Path,
        resume: ResumePolicy,
    ) -> Result<(u64, Option<u64>), ProviderError> {
        let partial = partial_path(destination);
        let io = |source: std::io::Error| ProviderError::Io {
            path: partial.clone(),
            source,
        };

        let partial_len = fs::metadata(&partial).await.ok().map(|meta| meta.len());
        let mut offset = resume_offset(resume, partial_len);

        let mut request = self.http.get(location.clone()).timeout(self.download_timeout);
        if offset > 0 {
            info!("Resuming {} from byte {}", destination.display(), offset);
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let mut response = request.send().await?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!("Range rejected for {}, restarting", destination.display());
            offset = 0;
            response = self
                .http
                .get(location.clone())
                .timeout(self.download_timeout)
                .send()
                .await?;
        }
        let response = check(response).await?;

        let plan = plan_body(
            offset,
            response.status(),
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok()),
            response.content_length(),
        );
        let (offset, expected_size) = (plan.append_from, plan.expected_size);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(offset > 0)
            .truncate(offset == 0)
            .open(&partial)
            .await
            .map_err(io)?;

        let mut written = offset;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Keep what arrived so a range resume can pick it up.
                    file.flush().await.map_err(io)?;
                    return Err(e.into());
                }
            };
            file.write_all(&chunk).await.map_err(io)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io)?;
        drop(file);

        let complete = expected_size.map_or(true, |size| written >= size);
        if complete {
            fs::rename(&partial, destination)
                .await
                .map_err(|source| ProviderError::Io {
                    path: destination.to_path_buf(),
                    source,
                })?;
        } else {
            warn!(
                "Transfer of {} stopped at {} of {:?} bytes",
                destination.display(),
                written,
                expected_size
            );
        }
        Ok((written, expected_size))
    }
}

impl ImageryProvider for PlanetClient {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Scene>, ProviderError> {
        info!("Searching for {} imagery...", request.item_type);
        let body = build_search_body(request);

        let mut scenes = vec![];
        let mut page = self.search_page(self.endpoint("quick-search")?, Some(&body)).await?;
        loop {
            let features = page
                .get("features")
                .and_then(Value::as_array)
                .ok_or_else(|| ProviderError::Decode("search response has no features".into()))?;
            scenes.extend(
                features
                    .iter()
                    .filter_map(|f| parse_feature(f, &request.item_type)),
            );

            let next = page
                .pointer("/_links/_next")
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok());
            match next {
                Some(url) if !features.is_empty() => page = self.search_page(url, None).await?,
                _ => break,
            }
        }
        info!("Found {} scenes matching the criteria", scenes.len());
        Ok(scenes)
    }

    async fn request_activation(
        &self,
        item_type: &str,
        key: &AssetKey,
    ) -> Result<Activation, ProviderError> {
        let entry = self.fetch_asset(item_type, key).await?;
        if entry.status == "active" {
            return Ok(Activation::AlreadyActive);
        }

        let link = match entry.links.activate {
            Some(link) => Url::parse(&link).map_err(|e| ProviderError::Decode(e.to_string()))?,
            None => self.endpoint(&format!(
                "item-types/{}/items/{}/assets/{}/activate",
                item_type, key.scene_id, key.asset_type
            ))?,
        };
        debug!("Activating {} via {}", key, link);

        let link = &link;
        retry_transient(&self.retry, &format!("activate {}", key), || async move {
            let response = check(self.authed(self.http.post(link.clone())).send().await?).await?;
            Ok::<_, ProviderError>(match response.status() {
                StatusCode::NO_CONTENT => Activation::AlreadyActive,
                _ => Activation::Accepted,
            })
        })
        .await
    }

    async fn poll_status(&self, item_type: &str, key: &AssetKey) -> Result<PollStatus, ProviderError> {
        let entry = self.fetch_asset(item_type, key).await?;
        parse_status(&entry.status)
    }

    async fn download(
        &self,
        item_type: &str,
        key: &AssetKey,
        destination: &Path,
        resume: ResumePolicy,
    ) -> Result<DownloadReceipt, ProviderError> {
        let entry = self.fetch_asset(item_type, key).await?;
        let location = match (parse_status(&entry.status)?, entry.location.as_deref()) {
            (PollStatus::Active, Some(location)) => {
                Url::parse(location).map_err(|e| ProviderError::Decode(e.to_string()))?
            }
            _ => return Err(ProviderError::Inactive(key.to_string())),
        };

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| ProviderError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let (bytes_on_disk, expected_size) =
            retry_transient(&self.retry, &format!("download {}", key), || {
                self.transfer(&location, destination, resume)
            })
            .await?;

        Ok(DownloadReceipt {
            bytes_on_disk,
            expected_size,
            md5: entry.md5_digest,
        })
    }
}

pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Map provider status codes onto the error taxonomy.
async fn check(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify(status, body))
}

fn classify(status: StatusCode, body: String) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth {
            status: status.as_u16(),
        },
        StatusCode::NOT_FOUND => ProviderError::NotFound(body),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        _ => ProviderError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

fn parse_status(status: &str) -> Result<PollStatus, ProviderError> {
    match status {
        "active" => Ok(PollStatus::Active),
        "activating" => Ok(PollStatus::Activating),
        "inactive" => Ok(PollStatus::Inactive),
        other => Err(ProviderError::Decode(format!("unknown asset status '{}'", other))),
    }
}

/// Quick-search body: point geometry, whole-day date range on `acquired`, cloud cover
/// as a fraction.
pub fn build_search_body(request: &SearchRequest) -> Value {
    json!({
        "item_types": [request.item_type],
        "filter": {
            "type": "AndFilter",
            "config": [
                {
                    "type": "GeometryFilter",
                    "field_name": "geometry",
                    "config": {
                        "type": "Point",
                        "coordinates": [request.point.longitude, request.point.latitude]
                    }
                },
                {
                    "type": "DateRangeFilter",
                    "field_name": "acquired",
                    "config": {
                        "gte": format!("{}T00:00:00.000Z", request.dates.start.format("%Y-%m-%d")),
                        "lte": format!("{}T23:59:59.999Z", request.dates.end.format("%Y-%m-%d"))
                    }
                },
                {
                    "type": "RangeFilter",
                    "field_name": "cloud_cover",
                    "config": { "lte": request.max_cloud_cover / 100.0 }
                }
            ]
        }
    })
}

fn parse_feature(feature: &Value, default_item_type: &str) -> Option<Scene> {
    let id = feature.get("id")?.as_str()?.to_string();
    let properties = feature.get("properties").cloned().unwrap_or(Value::Null);

    let item_type = properties
        .get("item_type")
        .and_then(Value::as_str)
        .unwrap_or(default_item_type)
        .to_string();
    let acquired = properties
        .get("acquired")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    // Unknown cover is treated as fully cloudy so it never slips past the filter.
    let cloud_cover = properties
        .get("cloud_cover")
        .and_then(Value::as_f64)
        .map_or(100.0, |fraction| fraction * 100.0);

    let asset_types = match feature.get("assets").and_then(Value::as_array) {
        Some(assets) => assets
            .iter()
            .filter_map(|a| a.as_str().map(str::to_string))
            .collect(),
        None => feature
            .get("_permissions")
            .and_then(Value::as_array)
            .map(|perms| {
                perms
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|p| p.strip_prefix("assets.")?.strip_suffix(":download"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };

    Some(Scene {
        id,
        item_type,
        acquired,
        cloud_cover,
        asset_types,
        properties,
    })
}

/// Byte offset to request from: what is already in the `.partial` under a range policy,
/// otherwise the start.
fn resume_offset(resume: ResumePolicy, partial_len: Option<u64>) -> u64 {
    match (resume, partial_len) {
        (ResumePolicy::Range, Some(len)) => len,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BodyPlan {
    /// Where the response body starts in the `.partial`; zero truncates.
    append_from: u64,
    expected_size: Option<u64>,
}

/// Decide how a successful download response lands in the `.partial`. Only a 206 continues
/// from `requested_offset`; any other success carries the whole object.
fn plan_body(
    requested_offset: u64,
    status: StatusCode,
    content_range: Option<&str>,
    content_length: Option<u64>,
) -> BodyPlan {
    if status == StatusCode::PARTIAL_CONTENT {
        BodyPlan {
            append_from: requested_offset,
            expected_size: content_range
                .and_then(content_range_total)
                .or_else(|| content_length.map(|len| len + requested_offset)),
        }
    } else {
        BodyPlan {
            append_from: 0,
            expected_size: content_length,
        }
    }
}

/// Total length from a `Content-Range: bytes 100-199/2000` header.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}
