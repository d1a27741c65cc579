//! Error taxonomy for batch configuration, design points and command construction.

use std::path::PathBuf;

/// Errors produced while resolving raw inputs into a [`RunConfig`].
///
/// Any of these is fatal to batch start: no engine process is launched.
///
/// [`RunConfig`]: crate::config::RunConfig
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration field `{field}` must not be empty")]
    EmptyField { field: &'static str },

    #[error("{resource} not found: {}", .path.display())]
    Missing { resource: String, path: PathBuf },

    #[error("{resource} is not a directory: {}", .path.display())]
    NotADirectory { resource: String, path: PathBuf },

    #[error("{resource} is not a regular file: {}", .path.display())]
    NotAFile { resource: String, path: PathBuf },

    #[error("java runtime `{program}` not found on PATH")]
    RuntimeNotFound { program: String },

    #[error("path is not valid UTF-8: {}", .path.display())]
    NonUtf8Path { path: PathBuf },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid design point in study `{study}`: {source}")]
    DesignPoint {
        study: String,
        #[source]
        source: DesignPointError,
    },

    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced when a token cannot be used as a design point, or when
/// a study's design points cannot be listed.
#[derive(Debug, thiserror::Error)]
pub enum DesignPointError {
    #[error("design point must not be empty")]
    Empty,

    #[error("design point `{0}` contains characters outside [A-Za-z0-9._-]")]
    InvalidCharacters(String),

    #[error("design point `{0}` must not contain `..`")]
    ParentTraversal(String),

    #[error("failed to discover design points in {}: {source}", .dir.display())]
    Discovery {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-release failures raised while materialising an invocation.
///
/// These never abort a batch; the coordinator records them as a failed
/// result for the affected design point only.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing {kind} for design point {design_point}: {}", .path.display())]
    MissingInput {
        design_point: String,
        kind: &'static str,
        path: PathBuf,
    },
}

/// Result type for configuration resolution.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type for command construction.
pub type BuildResult<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_resource_names_the_path() {
        let err = ConfigError::Missing {
            resource: "engine jar".to_string(),
            path: PathBuf::from("/opt/eptm/ePTM.jar"),
        };
        let msg = err.to_string();
        assert!(msg.contains("engine jar"));
        assert!(msg.contains("/opt/eptm/ePTM.jar"));
    }

    #[test]
    fn test_build_error_display() {
        let err = BuildError::MissingInput {
            design_point: "2".to_string(),
            kind: "input descriptor",
            path: PathBuf::from("cfg/eptm_config2.inp"),
        };
        let msg = err.to_string();
        assert!(msg.contains("input descriptor"));
        assert!(msg.contains("design point 2"));
        assert!(msg.contains("eptm_config2.inp"));
    }

    #[test]
    fn test_design_point_error_wraps_into_config_error() {
        let err = ConfigError::DesignPoint {
            study: "RUN_42".to_string(),
            source: DesignPointError::InvalidCharacters("a/b".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("RUN_42"));
        assert!(msg.contains("a/b"));
    }
}
