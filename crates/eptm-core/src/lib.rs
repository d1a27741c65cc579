//! ePTM batch core
//!
//! Everything a batch needs before a process is spawned:
//! - [`config`]: raw inputs → validated, immutable [`RunConfig`]
//! - [`design`]: study id → lazy sequence of [`DesignPoint`]s
//! - [`command`]: (config, design point) → engine [`Invocation`]
//!
//! plus the tracing setup ([`telemetry`]) and lifecycle events ([`obs`])
//! shared by the runner and the CLI.

pub mod command;
pub mod config;
pub mod design;
pub mod error;
pub mod obs;
pub mod telemetry;

pub use command::{build, Invocation};
pub use config::{
    resolve, AuxiliaryFiles, AuxiliaryOverrides, CaptureMode, ConcurrencyPolicy, ConfigOverrides,
    EngineSpec, ExecutionSettings, FileNaming, JvmTuning, RawConfig, RunConfig, StdioMode,
};
pub use design::{DesignPoint, DesignPointSource, DesignPoints, StudyCatalog, StudyDefinition};
pub use error::{BuildError, BuildResult, ConfigError, ConfigResult, DesignPointError};
pub use telemetry::init_tracing;
