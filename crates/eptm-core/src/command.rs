//! Engine invocation construction.
//!
//! [`build`] is a pure function of a [`RunConfig`] and a [`DesignPoint`]: the
//! same pair always yields a byte-identical [`Invocation`]. Positional
//! argument order is the engine's external contract:
//!
//! ```text
//! <runtime> -Xss.. -Xms.. -Xmx.. -jar <jar>
//!     <input descriptor> <behavior file> <output file>
//!     <config dir> <junctions dir>
//!     <bends> <junctions> <latVel> <latEps> <latdEp> <latd2Ep> <VerEps> <VerdEp>
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{EngineSpec, FileNaming, RunConfig};
use crate::design::{DesignPoint, INPUT_EXTENSION};
use crate::error::{BuildError, BuildResult};

/// Extension of behavior/calibration and output files (HDF5).
pub const DATA_EXTENSION: &str = "h5";

/// A fully materialised engine command for one design point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub design_point: DesignPoint,

    /// Program to execute (Java runtime or native engine).
    pub program: String,

    /// Arguments in engine order, not including the program.
    pub args: Vec<String>,

    pub input_path: PathBuf,
    pub behavior_path: PathBuf,

    /// Unique per design point within a batch.
    pub output_path: PathBuf,

    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    /// SHA-256 over program and arguments, NUL separated.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.program.as_bytes());
        hasher.update(b"\0");
        for arg in &self.args {
            hasher.update(arg.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }

    /// Shell-quoted command line, for logs and dry runs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub fn input_file_name(files: &FileNaming, point: &DesignPoint) -> String {
    format!("{}{}.{}", files.input_base, point, INPUT_EXTENSION)
}

pub fn behavior_file_name(files: &FileNaming, point: &DesignPoint) -> String {
    if files.per_release_behavior {
        format!("{}{}.{}", files.behavior_base, point, DATA_EXTENSION)
    } else {
        format!("{}.{}", files.behavior_base, DATA_EXTENSION)
    }
}

/// `<output_base><dp>_out.h5`. Injective: base and suffix are fixed, so two
/// distinct design points never share an output file.
pub fn output_file_name(files: &FileNaming, point: &DesignPoint) -> String {
    format!("{}{}_out.{}", files.output_base, point, DATA_EXTENSION)
}

/// Build the invocation for `point`.
///
/// Fails when the per-release input descriptor (or per-release behavior
/// file) is missing, so the failure is attributed to the inputs instead of
/// surfacing later as an opaque engine exit code.
pub fn build(config: &RunConfig, point: &DesignPoint) -> BuildResult<Invocation> {
    let input_path = config.input_dir.join(input_file_name(&config.files, point));
    require_file(&input_path, point, "input descriptor")?;

    let behavior_path = config
        .calibration_dir
        .join(behavior_file_name(&config.files, point));
    if config.files.per_release_behavior {
        require_file(&behavior_path, point, "behavior file")?;
    }

    let output_path = config.output_dir.join(output_file_name(&config.files, point));

    let mut args = Vec::with_capacity(19);
    let program = match &config.engine {
        EngineSpec::Jar { runtime, jar, jvm } => {
            args.extend(jvm.flags());
            args.push("-jar".to_string());
            args.push(path_arg(jar));
            path_arg(runtime)
        }
        EngineSpec::Native { executable } => path_arg(executable),
    };
    args.push(path_arg(&input_path));
    args.push(path_arg(&behavior_path));
    args.push(path_arg(&output_path));
    args.push(path_arg(&config.config_dir));
    args.push(path_arg(&config.junctions_dir));
    args.extend(config.auxiliary.ordered().iter().map(|name| name.to_string()));

    Ok(Invocation {
        design_point: point.clone(),
        program,
        args,
        input_path,
        behavior_path,
        output_path,
        working_dir: config.output_dir.clone(),
        env: config.execution.env.clone(),
    })
}

fn require_file(path: &Path, point: &DesignPoint, kind: &'static str) -> BuildResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(BuildError::MissingInput {
            design_point: point.to_string(),
            kind,
            path: path.to_path_buf(),
        })
    }
}

// Resolved paths are checked to be UTF-8, so this conversion is lossless.
fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
