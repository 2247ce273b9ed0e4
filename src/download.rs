//! Moves `Active` records to disk and through conversion.

use anyhow::Result;
use chrono::Utc;
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::DownloadSettings;
use crate::convert::Converter;
use crate::layout::OutputLayout;
use crate::provider::planet::partial_path;
use crate::provider::{DownloadReceipt, ImageryProvider, ResumePolicy};
use crate::record::{AssetRecord, AssetState};
use crate::status_store::StatusStore;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerifyError {
    #[error("transfer incomplete: {have} of {want} bytes")]
    Incomplete { have: u64, want: u64 },

    #[error("size mismatch: {have} bytes on disk, provider reported {want}")]
    SizeMismatch { have: u64, want: u64 },

    #[error("checksum mismatch: got {have}, provider reported {want}")]
    ChecksumMismatch { have: String, want: String },

    #[error("downloaded file missing: {0}")]
    Missing(String),
}

/// Check the file at `path` against what the provider advertised: byte count first,
/// then the md5 digest when one was supplied.
pub fn verify_transfer(path: &Path, receipt: &DownloadReceipt) -> Result<(), VerifyError> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => {
            return Err(match receipt.expected_size {
                Some(want) => VerifyError::Incomplete {
                    have: receipt.bytes_on_disk,
                    want,
                },
                None => VerifyError::Missing(path.display().to_string()),
            })
        }
    };

    if let Some(want) = receipt.expected_size {
        if len != want {
            return Err(VerifyError::SizeMismatch { have: len, want });
        }
    }

    if let Some(want) = receipt.md5.as_deref() {
        let have = md5_file(path).map_err(|_| VerifyError::Missing(path.display().to_string()))?;
        if !have.eq_ignore_ascii_case(want) {
            return Err(VerifyError::ChecksumMismatch {
                have,
                want: want.to_string(),
            });
        }
    }
    Ok(())
}

fn md5_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub converted: usize,
    pub failed: usize,
    /// Still `Active` after this pass.
    pub retry_later: usize,
}

pub struct DownloadOrchestrator<'a, P: ImageryProvider, C: Converter> {
    provider: &'a P,
    converter: &'a C,
    store: &'a StatusStore,
    layout: &'a OutputLayout,
    settings: &'a DownloadSettings,
    convert_enabled: bool,
    default_item_type: String,
}

impl<'a, P: ImageryProvider, C: Converter> DownloadOrchestrator<'a, P, C> {
    pub fn new(
        provider: &'a P,
        converter: &'a C,
        store: &'a StatusStore,
        layout: &'a OutputLayout,
        settings: &'a DownloadSettings,
        default_item_type: &str,
    ) -> Self {
        Self {
            provider,
            converter,
            store,
            layout,
            settings,
            convert_enabled: true,
            default_item_type: default_item_type.to_string(),
        }
    }

    /// Leave downloaded records in `Downloaded` instead of converting them.
    pub fn without_conversion(mut self) -> Self {
        self.convert_enabled = false;
        self
    }

    pub async fn run_pass(&self) -> Result<DownloadReport> {
        let pending: Vec<AssetRecord> = self
            .store
            .load()?
            .into_values()
            .filter(|r| matches!(r.state, AssetState::Active | AssetState::Downloaded))
            .collect();

        let mut report = DownloadReport::default();
        for mut record in pending {
            if record.state == AssetState::Active {
                self.download(&mut record, &mut report).await?;
            }
            if record.state == AssetState::Downloaded && self.convert_enabled {
                self.convert(&mut record, &mut report).await?;
            }
        }
        Ok(report)
    }

    async fn download(&self, record: &mut AssetRecord, report: &mut DownloadReport) -> Result<()> {
        let key = record.key();
        let item_type = if record.item_type.is_empty() {
            self.default_item_type.clone()
        } else {
            record.item_type.clone()
        };
        let destination = self.layout.raw_path(record);
        let mut last_error = String::from("no attempts left");

        while record.download_attempts < self.settings.max_attempts {
            record.download_attempts += 1;
            info!(
                asset = %key,
                "Downloading to {} (attempt {}/{})",
                destination.display(),
                record.download_attempts,
                self.settings.max_attempts
            );

            let result = self
                .provider
                .download(&item_type, &key, &destination, self.settings.resume)
                .await;

            match result {
                Ok(receipt) => {
                    record.expected_size = receipt.expected_size;
                    record.checksum = receipt.md5.clone();
                    match verify_transfer(&destination, &receipt) {
                        Ok(()) => {
                            record.download_path = Some(destination.clone());
                            record.advance(AssetState::Downloaded, Utc::now())?;
                            self.store.upsert(record)?;
                            report.downloaded += 1;
                            info!(asset = %key, "Downloaded {} bytes", receipt.bytes_on_disk);
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(asset = %key, "Download rejected: {}", e);
                            self.discard(&destination, &e)?;
                            last_error = e.to_string();
                        }
                    }
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) if e.is_asset_terminal() => {
                    warn!(asset = %key, "Giving up: {}", e);
                    record.fail(e.to_string(), Utc::now())?;
                    self.store.upsert(record)?;
                    report.failed += 1;
                    return Ok(());
                }
                Err(e) => {
                    warn!(asset = %key, "Download failed: {}", e);
                    last_error = e.to_string();
                }
            }
            self.store.upsert(record)?;
        }

        let reason = format!(
            "download failed after {} attempts: {}",
            record.download_attempts, last_error
        );
        warn!(asset = %key, "{}", reason);
        record.fail(reason, Utc::now())?;
        self.store.upsert(record)?;
        report.failed += 1;
        Ok(())
    }

    /// A short transfer keeps its `.partial` for a range resume; anything that looks
    /// complete but does not verify is thrown away.
    fn discard(&self, destination: &Path, error: &VerifyError) -> Result<()> {
        remove_if_present(destination)?;
        let keep_partial = matches!(error, VerifyError::Incomplete { .. })
            && self.settings.resume == ResumePolicy::Range;
        if !keep_partial {
            remove_if_present(&partial_path(destination))?;
        }
        Ok(())
    }

    async fn convert(&self, record: &mut AssetRecord, report: &mut DownloadReport) -> Result<()> {
        let key = record.key();
        let raw = record
            .download_path
            .clone()
            .unwrap_or_else(|| self.layout.raw_path(record));
        let output = self.layout.converted_path(record);

        info!(asset = %key, "Converting with {}", self.converter.name());
        match self.converter.convert(&raw, &output).await {
            Ok(()) => {
                record.converted_path = Some(output);
                record.advance(AssetState::Converted, Utc::now())?;
                report.converted += 1;
            }
            Err(e) => {
                warn!(asset = %key, "Conversion failed: {}", e);
                record.fail(format!("conversion failed: {}", e), Utc::now())?;
                report.failed += 1;
            }
        }
        self.store.upsert(record)?;
        Ok(())
    }
}
