//! Error types for batch execution.

use std::path::PathBuf;

use eptm_core::{ConfigError, DesignPointError};

/// Failures that stop a batch as a whole.
///
/// Per-release problems (missing inputs, non-zero exits, timeouts) are never
/// surfaced here; they become failed entries in the manifest.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("design point enumeration failed: {0}")]
    DesignPoints(#[from] DesignPointError),

    #[error("failed to prepare {}: {source}", .path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("launch slots closed while the batch was running")]
    SlotsClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type BatchResult<T> = std::result::Result<T, BatchError>;

pub type ManifestResult<T> = std::result::Result<T, ManifestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let err: BatchError = ConfigError::EmptyField {
            field: "paths.output_dir",
        }
        .into();
        assert!(matches!(err, BatchError::Config(_)));
        assert!(err.to_string().contains("paths.output_dir"));
    }

    #[test]
    fn test_manifest_io_error_names_path() {
        let err = ManifestError::Io {
            path: PathBuf::from("/tmp/out/RUN_42.manifest.json"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("RUN_42.manifest.json"));
    }
}
