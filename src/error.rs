use std::path::PathBuf;
use thiserror::Error;

use crate::record::AssetState;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider rejected the credentials (HTTP {status})")]
    Auth { status: u16 },

    #[error("Rate limited by provider")]
    RateLimited,

    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("Asset is not active: {0}")]
    Inactive(String),

    #[error("Unexpected HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unable to decode provider response: {0}")]
    Decode(String),

    #[error("I/O error while writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProviderError {
    /// Bad credentials and local filesystem failures are wrong for the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::Io { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited | Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Errors that end the life of one asset without affecting the rest of the run.
    pub fn is_asset_terminal(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Inactive(_))
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Status store {path} is corrupt and was left untouched: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Unable to access status store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to serialize status store: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{key}: illegal transition {from:?} -> {to:?}")]
    Illegal {
        key: String,
        from: AssetState,
        to: AssetState,
    },

    #[error("{key}: record is terminal ({state:?}) and cannot change")]
    Terminal { key: String, state: AssetState },
}

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Raw asset not found: {0}")]
    InputNotFound(PathBuf),

    #[error("Unable to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Planet API key not found. Set PLANET_API_KEY in the environment or in {0}")]
    Missing(String),

    #[error("Unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ProviderError::Auth { status: 401 }.is_fatal());
        assert!(!ProviderError::RateLimited.is_fatal());
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Status {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(ProviderError::NotFound("x".into()).is_asset_terminal());
        assert!(ProviderError::Inactive("x".into()).is_asset_terminal());
        assert!(!ProviderError::RateLimited.is_asset_terminal());

        let disk_full = ProviderError::Io {
            path: PathBuf::from("/out/raw.tif"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "No space left on device"),
        };
        assert!(disk_full.is_fatal());
        assert!(!disk_full.is_retryable());
        assert!(!disk_full.is_asset_terminal());
    }
}
