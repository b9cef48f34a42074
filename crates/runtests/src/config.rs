//! Run configuration.
//!
//! Settings come from three layers, each a [`Settings`] record of optional
//! keys: built-in defaults, the `testconfig.toml` settings file, and the
//! command line. Later layers override earlier ones key by key. [`resolve`]
//! merges the layers and converts the user-facing strings into the typed,
//! immutable [`Configuration`] shared by the rest of the harness.
//!
//! # Examples
//!
//! ```rust,ignore
//! let file = Settings::load_file(None, Path::new("."))?;
//! let config = config::resolve(Settings::defaults(), file, cli.to_settings())?;
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::tools::{Tool, ToolPolicies, ToolPolicy};
use crate::variant::{Catalog, FsDirs, VariantSelection, absolute};

/// File name of the settings file looked up in the root directory.
pub const SETTINGS_FILE: &str = "testconfig.toml";

const DEFAULT_TIMEOUT: &str = "3m";
const DEFAULT_LOG_LEVEL: u8 = 2;

/// Widest range a test sequence may contain.
pub const MAX_SEQUENCE_SPAN: u32 = 10_000;

// =============================================================================
// Settings layers
// =============================================================================

/// One layer of raw settings. Every key is optional so layers can be merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Build variant names.
    #[serde(deserialize_with = "one_or_many")]
    pub build_type: Option<Vec<String>>,
    /// Filesystem variant names.
    #[serde(deserialize_with = "one_or_many")]
    pub fs_type: Option<Vec<String>>,
    /// Duration class names.
    #[serde(deserialize_with = "one_or_many")]
    pub test_type: Option<Vec<String>>,
    /// Test number ranges, e.g. `0-3,6`.
    pub test_sequence: Option<String>,
    /// Single test name, e.g. `TEST2`.
    pub test_case: Option<String>,
    /// Test groups (directory names) to run.
    pub groups: Option<Vec<String>>,
    /// Timeout with unit suffix, e.g. `90s`.
    pub timeout: Option<String>,
    pub keep_going: Option<bool>,
    pub rootdir: Option<PathBuf>,
    /// Value of `UNITTEST_LOG_LEVEL` passed to test binaries.
    pub unittest_log_level: Option<u8>,
    /// Show elapsed time in PASS banners.
    pub time: Option<bool>,
    pub pmem_fs_dir: Option<PathBuf>,
    pub non_pmem_fs_dir: Option<PathBuf>,
    /// Path of the external output matching tool.
    pub match_tool: Option<PathBuf>,
    pub valgrind: Option<PathBuf>,
    pub memcheck: Option<ToolPolicy>,
    pub pmemcheck: Option<ToolPolicy>,
    pub helgrind: Option<ToolPolicy>,
    pub drd: Option<ToolPolicy>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<OneOrMany>::deserialize(deserializer)?.map(|value| match value {
            OneOrMany::One(name) => vec![name],
            OneOrMany::Many(names) => names,
        }),
    )
}

impl Settings {
    /// Built-in defaults, the lowest-precedence layer.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            build_type: Some(vec!["debug".to_string()]),
            fs_type: Some(vec!["all".to_string()]),
            test_type: Some(vec!["check".to_string()]),
            test_sequence: Some(String::new()),
            timeout: Some(DEFAULT_TIMEOUT.to_string()),
            keep_going: Some(false),
            rootdir: Some(std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
            unittest_log_level: Some(DEFAULT_LOG_LEVEL),
            time: Some(false),
            valgrind: Some(PathBuf::from("valgrind")),
            ..Self::default()
        }
    }

    /// Parse a settings layer from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys.
    pub fn from_toml(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read a settings layer from a file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(path, &text)
    }

    /// Load the settings-file layer.
    ///
    /// An explicitly named file must exist. Without one, `testconfig.toml`
    /// in `root` is used when present and an empty layer otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load_file(explicit: Option<&Path>, root: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let path = root.join(SETTINGS_FILE);
        if path.is_file() {
            Self::from_file(&path)
        } else {
            debug!(path = %path.display(), "no settings file, using defaults");
            Ok(Self::default())
        }
    }

    /// Overlay `over` on top of `self`; keys set in `over` win.
    #[must_use]
    pub fn merge(self, over: Self) -> Self {
        Self {
            build_type: over.build_type.or(self.build_type),
            fs_type: over.fs_type.or(self.fs_type),
            test_type: over.test_type.or(self.test_type),
            test_sequence: over.test_sequence.or(self.test_sequence),
            test_case: over.test_case.or(self.test_case),
            groups: over.groups.or(self.groups),
            timeout: over.timeout.or(self.timeout),
            keep_going: over.keep_going.or(self.keep_going),
            rootdir: over.rootdir.or(self.rootdir),
            unittest_log_level: over.unittest_log_level.or(self.unittest_log_level),
            time: over.time.or(self.time),
            pmem_fs_dir: over.pmem_fs_dir.or(self.pmem_fs_dir),
            non_pmem_fs_dir: over.non_pmem_fs_dir.or(self.non_pmem_fs_dir),
            match_tool: over.match_tool.or(self.match_tool),
            valgrind: over.valgrind.or(self.valgrind),
            memcheck: over.memcheck.or(self.memcheck),
            pmemcheck: over.pmemcheck.or(self.pmemcheck),
            helgrind: over.helgrind.or(self.helgrind),
            drd: over.drd.or(self.drd),
        }
    }
}

// =============================================================================
// Resolved configuration
// =============================================================================

/// Resolved, immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Selected build, filesystem and duration variants.
    pub catalog: Catalog,
    /// Groups to run; empty means every group.
    pub groups: Vec<String>,
    /// Test numbers to run; empty means every test.
    pub test_sequence: BTreeSet<u32>,
    /// Single test name to run.
    pub test_case: Option<String>,
    pub timeout: Duration,
    /// Continue after a failed context instead of aborting the run.
    pub keep_going: bool,
    /// Directory tree searched for test descriptors.
    pub root_dir: PathBuf,
    pub unittest_log_level: u8,
    pub show_time: bool,
    pub tools: ToolPolicies,
    pub match_tool: PathBuf,
    pub valgrind: PathBuf,
}

impl Configuration {
    /// Whether tests from `group` take part in the run.
    #[must_use]
    pub fn selects_group(&self, group: &str) -> bool {
        self.groups.is_empty() || self.groups.iter().any(|g| g == group)
    }

    /// Whether a test passes the sequence and test-case filters.
    #[must_use]
    pub fn selects_test(&self, id: u32, name: &str) -> bool {
        let in_sequence = self.test_sequence.is_empty() || self.test_sequence.contains(&id);
        let named = self
            .test_case
            .as_deref()
            .is_none_or(|wanted| wanted.eq_ignore_ascii_case(name));
        in_sequence && named
    }

    /// Export configuration as a diagnostic string.
    #[must_use]
    pub fn to_diagnostic_string(&self) -> String {
        let names = |items: Vec<String>| items.join(", ");
        let mut lines = vec![
            format!("Root: {}", self.root_dir.display()),
            format!(
                "Builds: {}",
                names(
                    self.catalog
                        .available_builds()
                        .iter()
                        .map(|b| b.kind().to_string())
                        .collect()
                )
            ),
            format!(
                "Filesystems: {}",
                names(
                    self.catalog
                        .available_filesystems()
                        .iter()
                        .map(|f| f.kind().to_string())
                        .collect()
                )
            ),
            format!(
                "Durations: {}",
                names(
                    self.catalog
                        .available_durations()
                        .iter()
                        .map(ToString::to_string)
                        .collect()
                )
            ),
            format!("Timeout: {:?}", self.timeout),
            format!("Keep going: {}", self.keep_going),
        ];
        if !self.groups.is_empty() {
            lines.push(format!("Groups: {}", self.groups.join(", ")));
        }
        if !self.test_sequence.is_empty() {
            lines.push(format!("Sequence: {:?}", self.test_sequence));
        }
        for tool in Tool::ALL {
            if self.tools.get(tool) == ToolPolicy::ForceEnable {
                lines.push(format!("Force-enabled: {tool}"));
            }
        }
        lines.join("\n")
    }
}

/// Merge the three settings layers and convert them into a [`Configuration`].
///
/// # Errors
///
/// Returns [`ConfigError`] for unknown variant names, malformed timeout or
/// sequence strings, filesystem directories missing for a selected
/// filesystem, and more than one force-enabled tool.
pub fn resolve(
    defaults: Settings,
    file: Settings,
    cli: Settings,
) -> Result<Configuration, ConfigError> {
    let settings = defaults.merge(file).merge(cli);

    let root_dir = absolute(settings.rootdir.as_deref().unwrap_or_else(|| Path::new(".")));
    let selection = VariantSelection {
        builds: settings.build_type.unwrap_or_default(),
        filesystems: settings.fs_type.unwrap_or_default(),
        durations: settings.test_type.unwrap_or_default(),
    };
    let dirs = FsDirs {
        pmem: settings.pmem_fs_dir,
        non_pmem: settings.non_pmem_fs_dir,
    };
    let catalog = Catalog::build(&selection, &root_dir, &dirs)?;

    let timeout = parse_timeout(settings.timeout.as_deref().unwrap_or(DEFAULT_TIMEOUT))?;
    let test_sequence = parse_sequence(settings.test_sequence.as_deref().unwrap_or_default())?;

    let tools = ToolPolicies {
        memcheck: settings.memcheck.unwrap_or_default(),
        pmemcheck: settings.pmemcheck.unwrap_or_default(),
        helgrind: settings.helgrind.unwrap_or_default(),
        drd: settings.drd.unwrap_or_default(),
    };
    let forced: Vec<String> = tools.forced().map(|tool| tool.to_string()).collect();
    if forced.len() > 1 {
        return Err(ConfigError::ConflictingTools(forced.join(", ")));
    }

    let match_tool = settings
        .match_tool
        .map_or_else(|| root_dir.join("match"), |tool| absolute(&tool));

    Ok(Configuration {
        catalog,
        groups: settings.groups.unwrap_or_default(),
        test_sequence,
        test_case: settings.test_case,
        timeout,
        keep_going: settings.keep_going.unwrap_or(false),
        unittest_log_level: settings.unittest_log_level.unwrap_or(DEFAULT_LOG_LEVEL),
        show_time: settings.time.unwrap_or(false),
        tools,
        match_tool,
        valgrind: settings
            .valgrind
            .unwrap_or_else(|| PathBuf::from("valgrind")),
        root_dir,
    })
}

// =============================================================================
// String conversions
// =============================================================================

/// Parse a test sequence such as `0-3,6` into a sorted set of test numbers.
///
/// Ranges are inclusive. An empty string yields an empty set.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidSequence`] for non-numeric items, reversed
/// ranges and ranges wider than [`MAX_SEQUENCE_SPAN`].
pub fn parse_sequence(value: &str) -> Result<BTreeSet<u32>, ConfigError> {
    let mut sequence = BTreeSet::new();
    if value.trim().is_empty() {
        return Ok(sequence);
    }

    let invalid = |reason: String| ConfigError::InvalidSequence {
        value: value.to_string(),
        reason,
    };
    let number = |item: &str| {
        item.trim()
            .parse::<u32>()
            .map_err(|_| invalid(format!("'{}' is not a test number", item.trim())))
    };

    for item in value.split(',') {
        match item.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (number(start)?, number(end)?);
                if start > end {
                    return Err(invalid(format!("range {start}-{end} is reversed")));
                }
                if end - start >= MAX_SEQUENCE_SPAN {
                    return Err(invalid(format!(
                        "range {start}-{end} spans more than {MAX_SEQUENCE_SPAN} tests"
                    )));
                }
                sequence.extend(start..=end);
            }
            None => {
                sequence.insert(number(item)?);
            }
        }
    }
    Ok(sequence)
}

/// Parse a timeout such as `90s`, `15m`, `1.5h` or `2d`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidTimeout`] for a missing or unknown unit and
/// for a magnitude that is not a non-negative number.
pub fn parse_timeout(value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &'static str| ConfigError::InvalidTimeout {
        value: value.to_string(),
        reason,
    };

    let trimmed = value.trim();
    let unit = trimmed.chars().last().ok_or_else(|| invalid("empty value"))?;
    let seconds_per_unit: f64 = match unit {
        's' => 1.0,
        'm' => 60.0,
        'h' => 3_600.0,
        'd' => 86_400.0,
        c if c.is_ascii_digit() => return Err(invalid("missing unit (s, m, h or d)")),
        _ => return Err(invalid("unknown unit (expected s, m, h or d)")),
    };

    let magnitude: f64 = trimmed[..trimmed.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid("magnitude is not a number"))?;
    if !magnitude.is_finite() || magnitude < 0.0 {
        return Err(invalid("magnitude must be a non-negative number"));
    }

    Duration::try_from_secs_f64(magnitude * seconds_per_unit).map_err(|_| invalid("out of range"))
}

// =============================================================================
// Errors
// =============================================================================

/// Configuration error. Always fatal, raised before any test runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variant name that does not exist on this platform.
    #[error("unknown {kind} variant: {name}")]
    UnknownVariant { kind: &'static str, name: String },

    /// A variant kind with nothing selected.
    #[error("no {kind} variant selected")]
    EmptySelection { kind: &'static str },

    /// A filesystem variant whose directory is not configured.
    #[error("missing setting '{key}' required by the '{variant}' filesystem")]
    MissingSetting {
        key: &'static str,
        variant: &'static str,
    },

    /// Malformed timeout string.
    #[error("invalid timeout '{value}': {reason}")]
    InvalidTimeout { value: String, reason: &'static str },

    /// Malformed test sequence string.
    #[error("invalid test sequence '{value}': {reason}")]
    InvalidSequence { value: String, reason: String },

    /// More than one valgrind tool force-enabled.
    #[error("only one tool can be force-enabled, got: {0}")]
    ConflictingTools(String),

    /// Settings file could not be read.
    #[error("cannot read settings file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Settings file is not valid TOML or has unknown keys.
    #[error("invalid settings file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub(crate) fn unknown_variant(kind: &'static str, name: &str) -> Self {
        Self::UnknownVariant {
            kind,
            name: name.to_string(),
        }
    }
}
