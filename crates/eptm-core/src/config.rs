//! Run configuration: raw inputs and the validated, immutable [`RunConfig`].
//!
//! Raw inputs come from a TOML file ([`RawConfig::load`]) overlaid with
//! command-line / environment overrides ([`ConfigOverrides`]). [`resolve`]
//! checks that everything the engine reads already exists and makes every path
//! absolute, so a batch never depends on the process working directory once it
//! has started.
//!
//! ```toml
//! [engine]
//! jar = "/opt/eptm/ePTM.jar"
//!
//! [paths]
//! config_dir = "/data/eptm/config"
//! calibration_dir = "/data/eptm/calib"
//! output_dir = "/data/eptm/out"
//!
//! [files]
//! behavior_base = "behavior_params"
//!
//! [execution]
//! max_parallel = 8
//! timeout_secs = 7200
//!
//! [studies.RUN_42]
//! points = ["1", "2", "3"]
//! ```

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::design::{DesignPointSource, StudyCatalog, StudyDefinition};
use crate::error::{ConfigError, ConfigResult};

/// Java runtime used when the engine is a jar and none is configured.
pub const DEFAULT_RUNTIME: &str = "java";
/// Bytes of stdout/stderr kept per stream when output is captured inline.
pub const DEFAULT_CAPTURE_TAIL_BYTES: usize = 64 * 1024;
/// Log directory name under the output directory when none is configured.
pub const DEFAULT_LOG_SUBDIR: &str = "logs";

// ---------------------------------------------------------------------------
// Raw (deserialised) configuration
// ---------------------------------------------------------------------------

/// Configuration as written in the TOML file, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub engine: RawEngine,
    #[serde(default)]
    pub paths: RawPaths,
    #[serde(default)]
    pub files: FileNaming,
    #[serde(default)]
    pub auxiliary: AuxiliaryOverrides,
    #[serde(default)]
    pub execution: RawExecution,
    #[serde(default)]
    pub studies: BTreeMap<String, StudyDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEngine {
    /// Path to `ePTM.jar`; run through the Java runtime.
    pub jar: Option<PathBuf>,
    /// Path to a natively executable engine; mutually exclusive with `jar`.
    pub executable: Option<PathBuf>,
    /// Java runtime, a path or a program name looked up on `PATH`.
    pub runtime: Option<String>,
    #[serde(default)]
    pub jvm: JvmTuning,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPaths {
    pub config_dir: Option<PathBuf>,
    /// Defaults to `config_dir`.
    pub junctions_dir: Option<PathBuf>,
    /// Directory holding per-release input descriptors. Defaults to `config_dir`.
    pub input_dir: Option<PathBuf>,
    pub calibration_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    /// Only used with `capture = "log_files"`. Defaults to `<output_dir>/logs`.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawExecution {
    pub max_parallel: Option<usize>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub capture: CaptureMode,
    pub capture_tail_bytes: Option<usize>,
    /// Extra environment variables for every engine process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// How engine stdout/stderr are kept apart across concurrent runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Pipe both streams and keep their tails in the run result.
    #[default]
    Inline,
    /// Redirect each stream to a per-design-point log file.
    LogFiles,
}

impl RawConfig {
    pub fn from_toml_str(text: &str, origin: &Path) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Overlay command-line / environment values on top of the file values.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(jar) = &overrides.engine_jar {
            self.engine.jar = Some(jar.clone());
            self.engine.executable = None;
        }
        if let Some(executable) = &overrides.engine_executable {
            self.engine.executable = Some(executable.clone());
            self.engine.jar = None;
        }
        if let Some(runtime) = &overrides.runtime {
            self.engine.runtime = Some(runtime.clone());
        }
        if let Some(dir) = &overrides.config_dir {
            self.paths.config_dir = Some(dir.clone());
        }
        if let Some(dir) = &overrides.calibration_dir {
            self.paths.calibration_dir = Some(dir.clone());
        }
        if let Some(dir) = &overrides.output_dir {
            self.paths.output_dir = Some(dir.clone());
        }
        if let Some(n) = overrides.max_parallel {
            self.execution.max_parallel = Some(n);
        }
        if let Some(secs) = overrides.timeout_secs {
            self.execution.timeout_secs = Some(secs);
        }
    }
}

/// Values supplied outside the config file, typically via CLI flags or
/// `EPTM_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub engine_jar: Option<PathBuf>,
    pub engine_executable: Option<PathBuf>,
    pub runtime: Option<String>,
    pub config_dir: Option<PathBuf>,
    pub calibration_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub max_parallel: Option<usize>,
    pub timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Shared value types
// ---------------------------------------------------------------------------

/// JVM stack and heap sizing passed ahead of `-jar`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct JvmTuning {
    /// Thread stack size (`-Xss`).
    pub stack: String,
    /// Initial heap (`-Xms`).
    pub initial_heap: String,
    /// Maximum heap (`-Xmx`).
    pub max_heap: String,
}

impl Default for JvmTuning {
    fn default() -> Self {
        Self {
            stack: "5M".to_string(),
            initial_heap: "512M".to_string(),
            max_heap: "1024M".to_string(),
        }
    }
}

impl JvmTuning {
    pub fn flags(&self) -> [String; 3] {
        [
            format!("-Xss{}", self.stack),
            format!("-Xms{}", self.initial_heap),
            format!("-Xmx{}", self.max_heap),
        ]
    }

    fn validate(&self) -> ConfigResult<()> {
        for (name, value) in [
            ("stack", &self.stack),
            ("initial_heap", &self.initial_heap),
            ("max_heap", &self.max_heap),
        ] {
            if !is_memory_size(value) {
                return Err(ConfigError::Invalid(format!(
                    "engine.jvm.{name} `{value}` is not a JVM size such as 512M"
                )));
            }
        }
        Ok(())
    }
}

fn is_memory_size(value: &str) -> bool {
    let digits = value.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
    let suffix_len = value.len() - digits.len();
    !digits.is_empty() && suffix_len <= 1 && digits.chars().all(|c| c.is_ascii_digit())
}

/// Base names used to derive per-release file names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileNaming {
    /// Input descriptor is `<input_base><dp>.inp`.
    pub input_base: String,
    /// Behavior file is `<behavior_base>.h5`, or `<behavior_base><dp>.h5`.
    pub behavior_base: String,
    pub per_release_behavior: bool,
    /// Output is `<output_base><dp>_out.h5`.
    pub output_base: String,
}

impl Default for FileNaming {
    fn default() -> Self {
        Self {
            input_base: "eptm_config".to_string(),
            behavior_base: "behavior_parameters".to_string(),
            per_release_behavior: false,
            output_base: "eptm_output".to_string(),
        }
    }
}

/// Grid and mixing-profile files the engine reads, in engine argument order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryFiles {
    pub channel_orient_bends: String,
    pub junctions: String,
    pub lateral_velocity: String,
    pub lateral_diffusivity: String,
    pub lateral_diffusivity_gradient: String,
    pub lateral_diffusivity_curvature: String,
    pub vertical_diffusivity: String,
    pub vertical_diffusivity_gradient: String,
}

impl Default for AuxiliaryFiles {
    fn default() -> Self {
        Self {
            channel_orient_bends: "ChansOrientsBends812.csv".to_string(),
            junctions: "Junctions812.csv".to_string(),
            lateral_velocity: "latVel.csv".to_string(),
            lateral_diffusivity: "latEps.csv".to_string(),
            lateral_diffusivity_gradient: "latdEp.csv".to_string(),
            lateral_diffusivity_curvature: "latd2Ep.csv".to_string(),
            vertical_diffusivity: "VerEps.csv".to_string(),
            vertical_diffusivity_gradient: "VerdEp.csv".to_string(),
        }
    }
}

impl AuxiliaryFiles {
    /// File names in the order the engine expects them on its command line.
    pub fn ordered(&self) -> [&str; 8] {
        [
            self.channel_orient_bends.as_str(),
            self.junctions.as_str(),
            self.lateral_velocity.as_str(),
            self.lateral_diffusivity.as_str(),
            self.lateral_diffusivity_gradient.as_str(),
            self.lateral_diffusivity_curvature.as_str(),
            self.vertical_diffusivity.as_str(),
            self.vertical_diffusivity_gradient.as_str(),
        ]
    }

    /// Directory each file is read from: junctions come from the junctions
    /// directory, everything else from the configuration directory.
    fn locations<'a>(
        &'a self,
        config_dir: &'a Path,
        junctions_dir: &'a Path,
    ) -> impl Iterator<Item = (&'a str, &'a Path)> {
        self.ordered().into_iter().enumerate().map(move |(i, name)| {
            if i == 1 {
                (name, junctions_dir)
            } else {
                (name, config_dir)
            }
        })
    }
}

/// Partial replacement of [`AuxiliaryFiles`], at top level or per study.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuxiliaryOverrides {
    pub channel_orient_bends: Option<String>,
    pub junctions: Option<String>,
    pub lateral_velocity: Option<String>,
    pub lateral_diffusivity: Option<String>,
    pub lateral_diffusivity_gradient: Option<String>,
    pub lateral_diffusivity_curvature: Option<String>,
    pub vertical_diffusivity: Option<String>,
    pub vertical_diffusivity_gradient: Option<String>,
}

impl AuxiliaryOverrides {
    pub fn apply(&self, base: AuxiliaryFiles) -> AuxiliaryFiles {
        let pick = |o: &Option<String>, b: String| o.clone().unwrap_or(b);
        AuxiliaryFiles {
            channel_orient_bends: pick(&self.channel_orient_bends, base.channel_orient_bends),
            junctions: pick(&self.junctions, base.junctions),
            lateral_velocity: pick(&self.lateral_velocity, base.lateral_velocity),
            lateral_diffusivity: pick(&self.lateral_diffusivity, base.lateral_diffusivity),
            lateral_diffusivity_gradient: pick(
                &self.lateral_diffusivity_gradient,
                base.lateral_diffusivity_gradient,
            ),
            lateral_diffusivity_curvature: pick(
                &self.lateral_diffusivity_curvature,
                base.lateral_diffusivity_curvature,
            ),
            vertical_diffusivity: pick(&self.vertical_diffusivity, base.vertical_diffusivity),
            vertical_diffusivity_gradient: pick(
                &self.vertical_diffusivity_gradient,
                base.vertical_diffusivity_gradient,
            ),
        }
    }
}

/// Scheduling policy for engine processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// One process at a time.
    #[default]
    Serial,
    /// Up to `max_in_flight` processes at once.
    BoundedParallel { max_in_flight: usize },
}

impl ConcurrencyPolicy {
    pub fn from_max_parallel(max_parallel: usize) -> Self {
        if max_parallel <= 1 {
            Self::Serial
        } else {
            Self::BoundedParallel {
                max_in_flight: max_parallel,
            }
        }
    }

    /// Number of launch slots. Never zero.
    pub fn slots(&self) -> usize {
        match self {
            Self::Serial => 1,
            Self::BoundedParallel { max_in_flight } => (*max_in_flight).max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// How the engine is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineSpec {
    /// `<runtime> <jvm flags> -jar <jar> ...`
    Jar {
        runtime: PathBuf,
        jar: PathBuf,
        jvm: JvmTuning,
    },
    /// `<executable> ...`
    Native { executable: PathBuf },
}

/// Where engine stdout/stderr go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StdioMode {
    Capture { tail_bytes: usize },
    LogFiles { dir: PathBuf },
}

/// Execution knobs shared by every launch of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionSettings {
    pub policy: ConcurrencyPolicy,
    pub timeout: Option<Duration>,
    pub stdio: StdioMode,
    pub env: BTreeMap<String, String>,
}

/// Validated configuration for one batch. Every path is absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub engine: EngineSpec,
    pub config_dir: PathBuf,
    pub junctions_dir: PathBuf,
    pub input_dir: PathBuf,
    pub calibration_dir: PathBuf,
    pub output_dir: PathBuf,
    pub files: FileNaming,
    pub auxiliary: AuxiliaryFiles,
    pub execution: ExecutionSettings,
    catalog: StudyCatalog,
}

impl RunConfig {
    /// Studies declared in the configuration.
    pub fn catalog(&self) -> &StudyCatalog {
        &self.catalog
    }
}

/// Validate `raw` for a batch of `study_id` and produce a [`RunConfig`].
///
/// Fails on the first missing or malformed input, naming it. Reads the
/// filesystem but never writes to it.
pub fn resolve(raw: &RawConfig, study_id: &str) -> ConfigResult<RunConfig> {
    let engine = resolve_engine(&raw.engine)?;

    let config_dir = existing_dir(
        required(&raw.paths.config_dir, "paths.config_dir")?,
        "configuration directory",
    )?;
    let junctions_dir = match &raw.paths.junctions_dir {
        Some(dir) => existing_dir(non_empty(dir, "paths.junctions_dir")?, "junctions directory")?,
        None => config_dir.clone(),
    };
    let input_dir = match &raw.paths.input_dir {
        Some(dir) => existing_dir(non_empty(dir, "paths.input_dir")?, "input directory")?,
        None => config_dir.clone(),
    };
    let calibration_dir = existing_dir(
        required(&raw.paths.calibration_dir, "paths.calibration_dir")?,
        "calibration directory",
    )?;
    let output_dir = creatable_dir(required(&raw.paths.output_dir, "paths.output_dir")?)?;

    let files = raw.files.clone();
    validate_base(&files.input_base, "files.input_base")?;
    validate_base(&files.behavior_base, "files.behavior_base")?;
    validate_base(&files.output_base, "files.output_base")?;
    if !files.per_release_behavior {
        existing_file(
            calibration_dir.join(format!("{}.h5", files.behavior_base)),
            "behavior file",
        )?;
    }

    let study = raw.studies.get(study_id);
    let mut auxiliary = raw.auxiliary.apply(AuxiliaryFiles::default());
    if let Some(overrides) = study.and_then(|s| s.auxiliary.as_ref()) {
        debug!(study_id, "applying study auxiliary file overrides");
        auxiliary = overrides.apply(auxiliary);
    }
    for (name, dir) in auxiliary.locations(&config_dir, &junctions_dir) {
        if name.is_empty() || Path::new(name).file_name() != Some(OsStr::new(name)) {
            return Err(ConfigError::Invalid(format!(
                "auxiliary file `{name}` must be a bare file name"
            )));
        }
        existing_file(dir.join(name), &format!("auxiliary file {name}"))?;
    }

    let execution = resolve_execution(&raw.execution, &output_dir, raw.paths.log_dir.as_ref())?;

    let mut studies = BTreeMap::new();
    for (id, definition) in &raw.studies {
        let source = DesignPointSource::from_definition(definition)
            .map_err(|reason| ConfigError::Invalid(format!("study `{id}`: {reason}")))?;
        studies.insert(id.clone(), source);
    }
    if !studies.contains_key(study_id) {
        crate::design::DesignPoint::new(study_id).map_err(|source| ConfigError::DesignPoint {
            study: study_id.to_string(),
            source,
        })?;
    }
    let catalog = StudyCatalog::new(studies, input_dir.clone(), files.input_base.clone());

    Ok(RunConfig {
        engine,
        config_dir,
        junctions_dir,
        input_dir,
        calibration_dir,
        output_dir,
        files,
        auxiliary,
        execution,
        catalog,
    })
}

fn resolve_engine(raw: &RawEngine) -> ConfigResult<EngineSpec> {
    match (&raw.jar, &raw.executable) {
        (Some(_), Some(_)) => Err(ConfigError::Invalid(
            "engine.jar and engine.executable are mutually exclusive".to_string(),
        )),
        (None, None) => Err(ConfigError::EmptyField {
            field: "engine.jar",
        }),
        (None, Some(executable)) => Ok(EngineSpec::Native {
            executable: existing_file(non_empty(executable, "engine.executable")?, "engine executable")?,
        }),
        (Some(jar), None) => {
            raw.jvm.validate()?;
            let jar = existing_file(non_empty(jar, "engine.jar")?, "engine jar")?;
            let runtime = resolve_runtime(raw.runtime.as_deref().unwrap_or(DEFAULT_RUNTIME))?;
            Ok(EngineSpec::Jar {
                runtime,
                jar,
                jvm: raw.jvm.clone(),
            })
        }
    }
}

/// A runtime containing a path separator is taken as a path, anything else
/// is searched for on `PATH`.
fn resolve_runtime(program: &str) -> ConfigResult<PathBuf> {
    if program.is_empty() {
        return Err(ConfigError::EmptyField {
            field: "engine.runtime",
        });
    }
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return existing_file(candidate, "java runtime");
    }
    let search = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&search) {
        for name in executable_names(program) {
            let path = dir.join(&name);
            if path.is_file() {
                return utf8(absolutize(&path)?);
            }
        }
    }
    Err(ConfigError::RuntimeNotFound {
        program: program.to_string(),
    })
}

#[cfg(windows)]
fn executable_names(program: &str) -> Vec<String> {
    vec![program.to_string(), format!("{program}.exe")]
}

#[cfg(not(windows))]
fn executable_names(program: &str) -> Vec<String> {
    vec![program.to_string()]
}

fn resolve_execution(
    raw: &RawExecution,
    output_dir: &Path,
    log_dir: Option<&PathBuf>,
) -> ConfigResult<ExecutionSettings> {
    let max_parallel = raw.max_parallel.unwrap_or(1);
    if max_parallel == 0 {
        return Err(ConfigError::Invalid(
            "execution.max_parallel must be >= 1".to_string(),
        ));
    }
    let timeout = match raw.timeout_secs {
        Some(0) => {
            return Err(ConfigError::Invalid(
                "execution.timeout_secs must be > 0".to_string(),
            ))
        }
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };
    let stdio = match raw.capture {
        CaptureMode::Inline => StdioMode::Capture {
            tail_bytes: raw.capture_tail_bytes.unwrap_or(DEFAULT_CAPTURE_TAIL_BYTES),
        },
        CaptureMode::LogFiles => {
            let dir = match log_dir {
                Some(dir) => utf8(absolutize(non_empty(dir, "paths.log_dir")?)?)?,
                None => output_dir.join(DEFAULT_LOG_SUBDIR),
            };
            StdioMode::LogFiles { dir }
        }
    };
    Ok(ExecutionSettings {
        policy: ConcurrencyPolicy::from_max_parallel(max_parallel),
        timeout,
        stdio,
        env: raw.env.clone(),
    })
}

fn validate_base(value: &str, field: &'static str) -> ConfigResult<()> {
    if value.is_empty() {
        return Err(ConfigError::EmptyField { field });
    }
    if value.contains(['/', '\\']) {
        return Err(ConfigError::Invalid(format!(
            "{field} `{value}` must not contain path separators"
        )));
    }
    Ok(())
}

fn required<'a>(value: &'a Option<PathBuf>, field: &'static str) -> ConfigResult<&'a Path> {
    match value {
        Some(path) => non_empty(path, field),
        None => Err(ConfigError::EmptyField { field }),
    }
}

fn non_empty<'a>(path: &'a Path, field: &'static str) -> ConfigResult<&'a Path> {
    if path.as_os_str().is_empty() {
        Err(ConfigError::EmptyField { field })
    } else {
        Ok(path)
    }
}

fn absolutize(path: &Path) -> ConfigResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Engine arguments are passed as strings, so every path must be UTF-8.
fn utf8(path: PathBuf) -> ConfigResult<PathBuf> {
    if path.to_str().is_some() {
        Ok(path)
    } else {
        Err(ConfigError::NonUtf8Path { path })
    }
}

fn existing_dir(path: &Path, resource: &str) -> ConfigResult<PathBuf> {
    let path = utf8(absolutize(path)?)?;
    if !path.exists() {
        return Err(ConfigError::Missing {
            resource: resource.to_string(),
            path,
        });
    }
    if !path.is_dir() {
        return Err(ConfigError::NotADirectory {
            resource: resource.to_string(),
            path,
        });
    }
    Ok(path)
}

fn existing_file(path: impl AsRef<Path>, resource: &str) -> ConfigResult<PathBuf> {
    let path = utf8(absolutize(path.as_ref())?)?;
    if !path.exists() {
        return Err(ConfigError::Missing {
            resource: resource.to_string(),
            path,
        });
    }
    if !path.is_file() {
        return Err(ConfigError::NotAFile {
            resource: resource.to_string(),
            path,
        });
    }
    Ok(path)
}

/// The output directory is created at batch start; here it only has to exist
/// already or have an existing parent.
fn creatable_dir(path: &Path) -> ConfigResult<PathBuf> {
    let path = utf8(absolutize(path)?)?;
    if path.exists() {
        if !path.is_dir() {
            return Err(ConfigError::NotADirectory {
                resource: "output directory".to_string(),
                path,
            });
        }
        return Ok(path);
    }
    match path.parent() {
        Some(parent) if parent.is_dir() => Ok(path),
        _ => Err(ConfigError::Missing {
            resource: "output directory parent".to_string(),
            path,
        }),
    }
}
