//! Test case model and the `TESTS.toml` descriptor it is parsed from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::registry::RegistrationError;
use crate::tools::{ToolRequirement, ToolRequirements};
use crate::variant::{BuildKind, DurationTag, FsKind, resolve_names};

/// A sparse file created in the working directory before the test runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HoleyFile {
    pub name: String,
    pub size: u64,
}

/// One `[[test]]` entry of a descriptor file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestDescriptor {
    /// `TEST<n>`.
    pub name: String,
    /// Executable name, relative to the descriptor's directory.
    pub binary: String,
    /// Single positional argument; `{testdir}` expands to the working directory.
    #[serde(default)]
    pub arg: String,
    #[serde(default)]
    pub duration: DurationTag,
    /// Restrict the test to these builds.
    #[serde(default)]
    pub builds: Option<Vec<String>>,
    /// Restrict the test to these filesystems.
    #[serde(default)]
    pub fs: Option<Vec<String>>,
    /// Compare output against `<id>.log.match` files.
    #[serde(default = "default_true", rename = "match")]
    pub match_output: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub memcheck: Option<ToolRequirement>,
    #[serde(default)]
    pub pmemcheck: Option<ToolRequirement>,
    #[serde(default)]
    pub helgrind: Option<ToolRequirement>,
    #[serde(default)]
    pub drd: Option<ToolRequirement>,
    #[serde(default)]
    pub holey_files: Vec<HoleyFile>,
}

const fn default_true() -> bool {
    true
}

impl TestDescriptor {
    /// Descriptor with every optional key at its default.
    #[must_use]
    pub fn new(name: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            arg: String::new(),
            duration: DurationTag::default(),
            builds: None,
            fs: None,
            match_output: true,
            env: BTreeMap::new(),
            memcheck: None,
            pmemcheck: None,
            helgrind: None,
            drd: None,
            holey_files: Vec::new(),
        }
    }

    const fn tools(&self) -> ToolRequirements {
        ToolRequirements {
            memcheck: self.memcheck,
            pmemcheck: self.pmemcheck,
            helgrind: self.helgrind,
            drd: self.drd,
        }
    }
}

/// Numeric id of a `TEST<n>` name.
#[must_use]
pub fn parse_test_id(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("TEST")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// A registered test case, validated and with variant restrictions resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    group: String,
    name: String,
    id: u32,
    dir: PathBuf,
    binary: String,
    arg: String,
    duration: DurationTag,
    builds: Option<Vec<BuildKind>>,
    filesystems: Option<Vec<FsKind>>,
    match_output: bool,
    env: BTreeMap<String, String>,
    tools: ToolRequirements,
    holey_files: Vec<HoleyFile>,
    instance: usize,
}

impl TestCase {
    /// Validate a descriptor found in `dir`, whose name is the test group.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError`] for a name that is not `TEST<n>`, an
    /// unknown build or filesystem restriction, or more than one required tool.
    pub fn from_descriptor(
        group: &str,
        dir: &Path,
        descriptor: TestDescriptor,
    ) -> Result<Self, RegistrationError> {
        let id = parse_test_id(&descriptor.name).ok_or_else(|| RegistrationError::InvalidName {
            group: group.to_string(),
            name: descriptor.name.clone(),
        })?;
        let qualified = format!("{group}/{}", descriptor.name);

        let unknown = |kind: &'static str| {
            let qualified = qualified.clone();
            move |name: &str| RegistrationError::UnknownVariant {
                test: qualified,
                kind,
                name: name.to_string(),
            }
        };
        let builds = descriptor
            .builds
            .as_ref()
            .map(|names| {
                resolve_names(names.iter().map(String::as_str), |name| {
                    BuildKind::parse(name).map(|kind| vec![kind])
                })
                .map_err(unknown("build"))
            })
            .transpose()?;
        let filesystems = descriptor
            .fs
            .as_ref()
            .map(|names| {
                resolve_names(names.iter().map(String::as_str), FsKind::expand)
                    .map_err(unknown("filesystem"))
            })
            .transpose()?;

        let tools = descriptor.tools();
        let required: Vec<String> = tools.required().map(|tool| tool.to_string()).collect();
        if required.len() > 1 {
            return Err(RegistrationError::ConflictingTools {
                test: qualified,
                tools: required.join(", "),
            });
        }

        Ok(Self {
            group: group.to_string(),
            name: descriptor.name,
            id,
            dir: dir.to_path_buf(),
            binary: descriptor.binary,
            arg: descriptor.arg,
            duration: descriptor.duration,
            builds,
            filesystems,
            match_output: descriptor.match_output,
            env: descriptor.env,
            tools,
            holey_files: descriptor.holey_files,
            instance: 0,
        })
    }

    /// Ordinal among registered test cases with the same group and name.
    pub(crate) const fn set_instance(&mut self, instance: usize) {
        self.instance = instance;
    }

    /// Prefix of context working directory names: `<group>_<id>`, with the
    /// group suffixed `-<n>` for the n-th other directory sharing its name.
    #[must_use]
    pub fn workdir_stem(&self) -> String {
        match self.instance {
            0 => format!("{}_{}", self.group, self.id),
            n => format!("{}-{n}_{}", self.group, self.id),
        }
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// `<group>/TEST<n>`, as exported in `UNITTEST_NAME`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }

    /// Directory the descriptor was found in; the cwd of the test binary.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    #[must_use]
    pub fn arg(&self) -> &str {
        &self.arg
    }

    #[must_use]
    pub const fn duration(&self) -> DurationTag {
        self.duration
    }

    /// Builds the test is restricted to; `None` means any selected build.
    #[must_use]
    pub fn builds(&self) -> Option<&[BuildKind]> {
        self.builds.as_deref()
    }

    /// Filesystems the test is restricted to; `None` means any selected one.
    #[must_use]
    pub fn filesystems(&self) -> Option<&[FsKind]> {
        self.filesystems.as_deref()
    }

    #[must_use]
    pub const fn match_output(&self) -> bool {
        self.match_output
    }

    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub const fn tools(&self) -> &ToolRequirements {
        &self.tools
    }

    #[must_use]
    pub fn holey_files(&self) -> &[HoleyFile] {
        &self.holey_files
    }
}
