//! Design points and study enumeration.
//!
//! A study names a set of release-reach combinations. [`StudyCatalog::enumerate`]
//! turns a study id into a [`DesignPoints`] iterator that yields each point in a
//! stable order. Ranges and release × reach grids are generated on demand, so a
//! large study is never materialised up front unless the caller collects it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DesignPointError;

/// Separator between release and reach in grid-generated design points.
pub const GRID_SEPARATOR: char = '_';

/// Extension of per-release input descriptor files.
pub const INPUT_EXTENSION: &str = "inp";

/// Identifier of one release-reach combination.
///
/// The token is spliced into input and output file names, so construction
/// rejects anything outside `[A-Za-z0-9._-]` and any `..` sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DesignPoint(String);

impl DesignPoint {
    pub fn new(token: impl Into<String>) -> Result<Self, DesignPointError> {
        let token = token.into();
        if token.is_empty() {
            return Err(DesignPointError::Empty);
        }
        if !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(DesignPointError::InvalidCharacters(token));
        }
        if token.contains("..") {
            return Err(DesignPointError::ParentTraversal(token));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DesignPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DesignPoint {
    type Error = DesignPointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DesignPoint> for String {
    fn from(value: DesignPoint) -> Self {
        value.0
    }
}

/// Inclusive integer range of release numbers, optionally zero padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointRange {
    pub start: u64,
    pub end: u64,
    /// Minimum width; shorter numbers are left-padded with zeros.
    #[serde(default)]
    pub width: usize,
}

/// How a study's design points are produced, as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyDefinition {
    #[serde(default)]
    pub points: Vec<String>,
    #[serde(default)]
    pub range: Option<PointRange>,
    #[serde(default)]
    pub releases: Vec<String>,
    #[serde(default)]
    pub reaches: Vec<String>,
    #[serde(default)]
    pub discover: bool,
    /// Per-study replacement of auxiliary grid/profile file names.
    #[serde(default)]
    pub auxiliary: Option<crate::config::AuxiliaryOverrides>,
}

/// Validated source of design points for one study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesignPointSource {
    /// Declared order, duplicates removed.
    Explicit(Vec<DesignPoint>),
    Range(PointRange),
    /// Cartesian product `<release>_<reach>`, both axes sorted.
    Grid {
        releases: Vec<String>,
        reaches: Vec<String>,
    },
    /// Every `<input_base>*.inp` file in the input directory.
    Discover,
}

impl DesignPointSource {
    /// Validate a study definition. Exactly one source must be given.
    pub fn from_definition(definition: &StudyDefinition) -> Result<Self, String> {
        let mut declared = Vec::new();
        if !definition.points.is_empty() {
            declared.push("points");
        }
        if definition.range.is_some() {
            declared.push("range");
        }
        if !definition.releases.is_empty() || !definition.reaches.is_empty() {
            declared.push("releases/reaches");
        }
        if definition.discover {
            declared.push("discover");
        }
        match declared.len() {
            0 => return Err("no design-point source declared".to_string()),
            1 => {}
            _ => {
                return Err(format!(
                    "multiple design-point sources declared: {}",
                    declared.join(", ")
                ))
            }
        }

        if !definition.points.is_empty() {
            let mut seen = HashSet::new();
            let mut points = Vec::with_capacity(definition.points.len());
            for token in &definition.points {
                let point = DesignPoint::new(token.clone()).map_err(|e| e.to_string())?;
                if seen.insert(point.clone()) {
                    points.push(point);
                } else {
                    warn!(design_point = %point, "dropping duplicate design point");
                }
            }
            return Ok(Self::Explicit(points));
        }

        if let Some(range) = definition.range {
            return Ok(Self::Range(range));
        }

        if definition.discover {
            return Ok(Self::Discover);
        }

        if definition.releases.is_empty() || definition.reaches.is_empty() {
            return Err("a grid study needs both releases and reaches".to_string());
        }
        let releases = grid_axis("release", &definition.releases)?;
        let reaches = grid_axis("reach", &definition.reaches)?;
        Ok(Self::Grid { releases, reaches })
    }
}

fn grid_axis(axis: &str, tokens: &[String]) -> Result<Vec<String>, String> {
    let mut sorted = BTreeSet::new();
    for token in tokens {
        DesignPoint::new(token.clone()).map_err(|e| e.to_string())?;
        if token.contains(GRID_SEPARATOR) {
            return Err(format!(
                "{axis} `{token}` must not contain `{GRID_SEPARATOR}` (ambiguous grid key)"
            ));
        }
        sorted.insert(token.clone());
    }
    Ok(sorted.into_iter().collect())
}

/// The studies known to a resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyCatalog {
    studies: BTreeMap<String, DesignPointSource>,
    input_dir: PathBuf,
    input_base: String,
}

impl StudyCatalog {
    pub fn new(
        studies: BTreeMap<String, DesignPointSource>,
        input_dir: PathBuf,
        input_base: String,
    ) -> Self {
        Self {
            studies,
            input_dir,
            input_base,
        }
    }

    pub fn contains(&self, study_id: &str) -> bool {
        self.studies.contains_key(study_id)
    }

    pub fn study_ids(&self) -> impl Iterator<Item = &str> {
        self.studies.keys().map(String::as_str)
    }

    /// Produce the design points of `study_id`.
    ///
    /// A study id without a catalog entry is a single-release run: the id
    /// itself is the only design point. Calling this twice with the same id
    /// yields the same sequence.
    pub fn enumerate(&self, study_id: &str) -> Result<DesignPoints, DesignPointError> {
        let Some(source) = self.studies.get(study_id) else {
            debug!(study_id, "study not declared, running it as a single release");
            let point = DesignPoint::new(study_id)?;
            return Ok(DesignPoints::explicit(vec![point]));
        };

        Ok(match source {
            DesignPointSource::Explicit(points) => DesignPoints::explicit(points.clone()),
            DesignPointSource::Range(range) => DesignPoints::range(*range),
            DesignPointSource::Grid { releases, reaches } => {
                DesignPoints::grid(releases.clone(), reaches.clone())
            }
            DesignPointSource::Discover => {
                DesignPoints::explicit(discover(&self.input_dir, &self.input_base)?)
            }
        })
    }
}

/// List `<base><point>.inp` files in `dir`, sorted by point.
fn discover(dir: &Path, base: &str) -> Result<Vec<DesignPoint>, DesignPointError> {
    let entries = std::fs::read_dir(dir).map_err(|source| DesignPointError::Discovery {
        dir: dir.to_path_buf(),
        source,
    })?;

    let mut points = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|source| DesignPointError::Discovery {
            dir: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(token) = name
            .strip_prefix(base)
            .and_then(|rest| rest.strip_suffix(INPUT_EXTENSION))
            .and_then(|rest| rest.strip_suffix('.'))
        else {
            continue;
        };
        match DesignPoint::new(token) {
            Ok(point) => {
                points.insert(point);
            }
            Err(e) => warn!(file = %name, error = %e, "skipping input descriptor"),
        }
    }
    Ok(points.into_iter().collect())
}

/// Lazy, finite sequence of design points for one study.
#[derive(Debug, Clone)]
pub struct DesignPoints {
    inner: Inner,
}

#[derive(Debug, Clone)]
enum Inner {
    Explicit(std::vec::IntoIter<DesignPoint>),
    Range {
        next: u64,
        end: u64,
        width: usize,
        exhausted: bool,
    },
    Grid {
        releases: Vec<String>,
        reaches: Vec<String>,
        release: usize,
        reach: usize,
    },
}

impl DesignPoints {
    fn explicit(points: Vec<DesignPoint>) -> Self {
        Self {
            inner: Inner::Explicit(points.into_iter()),
        }
    }

    fn range(range: PointRange) -> Self {
        Self {
            inner: Inner::Range {
                next: range.start,
                end: range.end,
                width: range.width,
                exhausted: range.start > range.end,
            },
        }
    }

    fn grid(releases: Vec<String>, reaches: Vec<String>) -> Self {
        Self {
            inner: Inner::Grid {
                releases,
                reaches,
                release: 0,
                reach: 0,
            },
        }
    }
}

impl Iterator for DesignPoints {
    type Item = DesignPoint;

    fn next(&mut self) -> Option<DesignPoint> {
        match &mut self.inner {
            Inner::Explicit(points) => points.next(),
            Inner::Range {
                next,
                end,
                width,
                exhausted,
            } => {
                if *exhausted {
                    return None;
                }
                let current = *next;
                if current == *end {
                    *exhausted = true;
                } else {
                    *next += 1;
                }
                // Digits only, always a valid token.
                Some(DesignPoint(format!("{current:0width$}", width = *width)))
            }
            Inner::Grid {
                releases,
                reaches,
                release,
                reach,
            } => {
                let r = releases.get(*release)?;
                let x = reaches.get(*reach)?;
                let point = DesignPoint(format!("{r}{GRID_SEPARATOR}{x}"));
                *reach += 1;
                if *reach == reaches.len() {
                    *reach = 0;
                    *release += 1;
                }
                Some(point)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = match &self.inner {
            Inner::Explicit(points) => Some(points.len()),
            Inner::Range {
                next,
                end,
                exhausted,
                ..
            } => {
                if *exhausted {
                    Some(0)
                } else {
                    usize::try_from(end - next).ok().and_then(|n| n.checked_add(1))
                }
            }
            Inner::Grid {
                releases,
                reaches,
                release,
                reach,
            } => {
                let rows = releases.len().saturating_sub(*release);
                rows.checked_mul(reaches.len())
                    .map(|total| total.saturating_sub(*reach))
            }
        };
        match remaining {
            Some(n) => (n, Some(n)),
            None => (usize::MAX, None),
        }
    }
}
