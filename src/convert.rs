//! Raw asset to Cloud Optimized GeoTIFF conversion through an external GDAL process.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ConvertError;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ConvertSettings {
    pub enabled: bool,
    pub program: String,
    /// Passed between the output format flag and the file arguments.
    pub extra_args: Vec<String>,
}

impl Default for ConvertSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "gdal_translate".to_string(),
            extra_args: vec!["-co".to_string(), "COMPRESS=DEFLATE".to_string()],
        }
    }
}

pub trait Converter {
    fn name(&self) -> &str;

    async fn convert(&self, raw: &Path, output: &Path) -> Result<(), ConvertError>;
}

pub struct GdalConverter {
    settings: ConvertSettings,
}

impl GdalConverter {
    pub fn new(settings: ConvertSettings) -> Self {
        Self { settings }
    }

    fn build_args(&self, raw: &Path, output: &Path) -> Vec<String> {
        let mut args = vec!["-of".to_string(), "COG".to_string()];
        args.extend(self.settings.extra_args.iter().cloned());
        args.push(raw.to_string_lossy().to_string());
        args.push(output.to_string_lossy().to_string());
        args
    }
}

impl Converter for GdalConverter {
    fn name(&self) -> &str {
        &self.settings.program
    }

    async fn convert(&self, raw: &Path, output: &Path) -> Result<(), ConvertError> {
        if !raw.exists() {
            return Err(ConvertError::InputNotFound(raw.to_path_buf()));
        }
        let args = self.build_args(raw, output);
        debug!("{} {}", self.settings.program, args.join(" "));

        let result = Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ConvertError::Launch {
                program: self.settings.program.clone(),
                source,
            })?;

        if !result.status.success() {
            // Don't leave a half-written COG next to the raw file.
            let _ = tokio::fs::remove_file(output).await;
            return Err(ConvertError::Failed {
                program: self.settings.program.clone(),
                code: result.status.code(),
                stderr: tail(&String::from_utf8_lossy(&result.stderr), 10),
            });
        }

        info!("Converted {} -> {}", raw.display(), output.display());
        Ok(())
    }
}

/// Last `lines` lines of a diagnostic stream.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
