//! Build, filesystem and duration variants.
//!
//! A [`Catalog`] is built in two phases. Names are first resolved into
//! variant kinds, with the `all` filesystem meta-variant expanding into
//! `pmem` followed by `nonpmem`. The kinds are then instantiated with their
//! directories and environment overlays. The cross product downstream only
//! ever sees concrete variants.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigError;

/// Environment variables a variant sets on top of the process environment.
pub type EnvOverlay = BTreeMap<OsString, OsString>;

// =============================================================================
// Build variants
// =============================================================================

/// A compiled configuration of the software under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BuildKind {
    Debug,
    Release,
    StaticDebug,
    StaticRelease,
}

impl BuildKind {
    /// Every build kind, supported on this platform or not.
    pub const ALL: [Self; 4] = [
        Self::Debug,
        Self::Release,
        Self::StaticDebug,
        Self::StaticRelease,
    ];

    /// Canonical lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
            Self::StaticDebug => "static-debug",
            Self::StaticRelease => "static-release",
        }
    }

    /// Case-insensitive lookup, accepting the historical `nondebug` spellings.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "release" | "nondebug" => Some(Self::Release),
            "static-debug" | "static_debug" => Some(Self::StaticDebug),
            "static-release" | "static_release" | "static-nondebug" | "static_nondebug" => {
                Some(Self::StaticRelease)
            }
            _ => None,
        }
    }

    /// Static builds are not produced on Windows.
    #[must_use]
    pub const fn is_available(self) -> bool {
        !cfg!(windows) || matches!(self, Self::Debug | Self::Release)
    }

    /// Build kinds that exist on this platform.
    pub fn available() -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(|kind| kind.is_available())
    }

    const fn lib_dir_name(self) -> &'static str {
        match self {
            Self::Debug | Self::StaticDebug => "debug",
            Self::Release | Self::StaticRelease => "nondebug",
        }
    }

    const fn exe_suffix(self) -> &'static str {
        match self {
            Self::Debug | Self::Release => "",
            Self::StaticDebug => ".static-debug",
            Self::StaticRelease => ".static-nondebug",
        }
    }
}

impl fmt::Display for BuildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An instantiated build variant with its environment overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildVariant {
    kind: BuildKind,
    env: EnvOverlay,
    exe_suffix: &'static str,
    exe_dir: Option<PathBuf>,
}

impl BuildVariant {
    /// Instantiate a build kind relative to the test root directory.
    #[must_use]
    pub fn new(kind: BuildKind, root: &Path) -> Self {
        let mut env = EnvOverlay::new();
        let exe_dir = if cfg!(windows) {
            let config = match kind {
                BuildKind::Debug | BuildKind::StaticDebug => "Debug",
                BuildKind::Release | BuildKind::StaticRelease => "Release",
            };
            let build_dir = root.join("..").join("x64").join(config);
            let mut paths: Vec<PathBuf> = std::env::var_os("PATH")
                .map(|path| std::env::split_paths(&path).collect())
                .unwrap_or_default();
            paths.push(build_dir.join("libs"));
            if let Ok(joined) = std::env::join_paths(paths) {
                env.insert(OsString::from("PATH"), joined);
            }
            Some(build_dir.join("tests"))
        } else {
            env.insert(
                OsString::from("LD_LIBRARY_PATH"),
                root.join("..").join(kind.lib_dir_name()).into_os_string(),
            );
            None
        };

        Self {
            kind,
            env,
            exe_suffix: kind.exe_suffix(),
            exe_dir,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> BuildKind {
        self.kind
    }

    /// Variables layered over the process environment.
    #[must_use]
    pub const fn env(&self) -> &EnvOverlay {
        &self.env
    }

    #[must_use]
    pub const fn exe_suffix(&self) -> &'static str {
        self.exe_suffix
    }

    /// Directory holding test executables, when it differs from the test's own.
    #[must_use]
    pub fn exe_dir(&self) -> Option<&Path> {
        self.exe_dir.as_deref()
    }

    /// Path of a test binary for this build.
    #[must_use]
    pub fn executable(&self, test_dir: &Path, binary: &str) -> PathBuf {
        match &self.exe_dir {
            Some(dir) => dir.join(format!("{binary}.exe")),
            None => test_dir.join(format!("{binary}{}", self.exe_suffix)),
        }
    }
}

// =============================================================================
// Filesystem variants
// =============================================================================

/// A storage backend class a test may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FsKind {
    /// Persistent-memory-backed filesystem.
    Pmem,
    /// Regular filesystem.
    NonPmem,
    /// The test does not touch the filesystem.
    None,
    /// Any configured filesystem will do.
    Any,
}

impl FsKind {
    /// Canonical lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pmem => "pmem",
            Self::NonPmem => "nonpmem",
            Self::None => "none",
            Self::Any => "any",
        }
    }

    /// Resolve a name into concrete kinds; `all` is the pmem + non-pmem pair.
    #[must_use]
    pub fn expand(name: &str) -> Option<Vec<Self>> {
        let kinds = match name.to_ascii_lowercase().as_str() {
            "pmem" => vec![Self::Pmem],
            "nonpmem" | "non-pmem" | "non_pmem" => vec![Self::NonPmem],
            "none" | "nofs" => vec![Self::None],
            "any" | "anyfs" => vec![Self::Any],
            "all" | "allfs" => vec![Self::Pmem, Self::NonPmem],
            _ => return None,
        };
        Some(kinds)
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Directories of the already-provisioned test filesystems.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsDirs {
    pub pmem: Option<PathBuf>,
    pub non_pmem: Option<PathBuf>,
}

/// An instantiated filesystem variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsVariant {
    kind: FsKind,
    dir: Option<PathBuf>,
}

impl FsVariant {
    /// Instantiate a filesystem kind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSetting`] when the directory the kind
    /// needs is not configured.
    pub fn new(kind: FsKind, dirs: &FsDirs) -> Result<Self, ConfigError> {
        let dir = match kind {
            FsKind::Pmem => Some(dirs.pmem.as_deref().map(absolute).ok_or(
                ConfigError::MissingSetting {
                    key: "pmem_fs_dir",
                    variant: kind.name(),
                },
            )?),
            FsKind::NonPmem => Some(dirs.non_pmem.as_deref().map(absolute).ok_or(
                ConfigError::MissingSetting {
                    key: "non_pmem_fs_dir",
                    variant: kind.name(),
                },
            )?),
            FsKind::Any => Some(
                dirs.pmem
                    .as_deref()
                    .map(absolute)
                    .or_else(|| dirs.non_pmem.as_deref().map(absolute))
                    .ok_or(ConfigError::MissingSetting {
                        key: "pmem_fs_dir or non_pmem_fs_dir",
                        variant: kind.name(),
                    })?,
            ),
            FsKind::None => None,
        };
        Ok(Self { kind, dir })
    }

    #[must_use]
    pub const fn kind(&self) -> FsKind {
        self.kind
    }

    /// Base directory under which context working directories are created.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

/// `path` made absolute against the current directory.
pub(crate) fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

// =============================================================================
// Durations
// =============================================================================

/// The duration a test case declares for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationTag {
    Short,
    Medium,
    #[default]
    Check,
    Long,
}

impl DurationTag {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Check => "check",
            Self::Long => "long",
        }
    }
}

impl fmt::Display for DurationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A run-time duration filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurationClass {
    Short,
    Medium,
    Long,
    Check,
    All,
}

impl DurationClass {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
            Self::Check => "check",
            Self::All => "all",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "short" => Some(Self::Short),
            "medium" => Some(Self::Medium),
            "long" => Some(Self::Long),
            "check" => Some(Self::Check),
            "all" | "alltypes" => Some(Self::All),
            _ => None,
        }
    }

    /// Tags this class selects.
    #[must_use]
    pub const fn including(self) -> &'static [DurationTag] {
        match self {
            Self::Short => &[DurationTag::Short],
            Self::Medium => &[DurationTag::Medium],
            Self::Long => &[DurationTag::Long],
            Self::Check => &[DurationTag::Short, DurationTag::Medium, DurationTag::Check],
            Self::All => &[
                DurationTag::Short,
                DurationTag::Medium,
                DurationTag::Check,
                DurationTag::Long,
            ],
        }
    }

    #[must_use]
    pub fn includes(self, tag: DurationTag) -> bool {
        self.including().contains(&tag)
    }
}

impl fmt::Display for DurationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Resolve names into kinds, dropping duplicates and preserving first-seen order.
///
/// Returns the first name `lookup` does not recognise as the error.
pub fn resolve_names<'n, T, I>(
    names: I,
    lookup: impl Fn(&str) -> Option<Vec<T>>,
) -> Result<Vec<T>, &'n str>
where
    T: PartialEq,
    I: IntoIterator<Item = &'n str>,
{
    let mut resolved = Vec::new();
    for name in names {
        for kind in lookup(name).ok_or(name)? {
            if !resolved.contains(&kind) {
                resolved.push(kind);
            }
        }
    }
    Ok(resolved)
}

/// Variant names selected for a run, before instantiation.
#[derive(Debug, Clone, Default)]
pub struct VariantSelection {
    pub builds: Vec<String>,
    pub filesystems: Vec<String>,
    pub durations: Vec<String>,
}

/// The variants available for one run on this platform.
#[derive(Debug, Clone)]
pub struct Catalog {
    builds: Vec<BuildVariant>,
    filesystems: Vec<FsVariant>,
    durations: Vec<DurationClass>,
}

impl Catalog {
    /// Resolve and instantiate the selected variants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unknown names, empty selections, build
    /// kinds unsupported on this platform, and filesystems whose directory
    /// is not configured.
    pub fn build(
        selection: &VariantSelection,
        root: &Path,
        dirs: &FsDirs,
    ) -> Result<Self, ConfigError> {
        let build_kinds = resolve_names(selection.builds.iter().map(String::as_str), |name| {
            BuildKind::parse(name)
                .filter(|kind| kind.is_available())
                .map(|kind| vec![kind])
        })
        .map_err(|name| ConfigError::unknown_variant("build", name))?;
        let fs_kinds = resolve_names(selection.filesystems.iter().map(String::as_str), FsKind::expand)
            .map_err(|name| ConfigError::unknown_variant("filesystem", name))?;
        let durations = resolve_names(selection.durations.iter().map(String::as_str), |name| {
            DurationClass::parse(name).map(|class| vec![class])
        })
        .map_err(|name| ConfigError::unknown_variant("duration", name))?;

        if build_kinds.is_empty() {
            return Err(ConfigError::EmptySelection { kind: "build" });
        }
        if fs_kinds.is_empty() {
            return Err(ConfigError::EmptySelection { kind: "filesystem" });
        }
        if durations.is_empty() {
            return Err(ConfigError::EmptySelection { kind: "duration" });
        }

        let builds = build_kinds
            .into_iter()
            .map(|kind| BuildVariant::new(kind, root))
            .collect();
        let filesystems = fs_kinds
            .into_iter()
            .map(|kind| FsVariant::new(kind, dirs))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            builds,
            filesystems,
            durations,
        })
    }

    #[must_use]
    pub fn available_builds(&self) -> &[BuildVariant] {
        &self.builds
    }

    #[must_use]
    pub fn available_filesystems(&self) -> &[FsVariant] {
        &self.filesystems
    }

    #[must_use]
    pub fn available_durations(&self) -> &[DurationClass] {
        &self.durations
    }

    /// Whether any selected duration class includes `tag`.
    #[must_use]
    pub fn admits(&self, tag: DurationTag) -> bool {
        self.durations.iter().any(|class| class.includes(tag))
    }
}
