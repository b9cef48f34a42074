//! Valgrind instrumentation layered on top of test binary invocations.
//!
//! Each [`Tool`] has a run-wide [`ToolPolicy`] (from the CLI or settings file)
//! and an optional per-test [`ToolRequirement`] (from the test descriptor).
//! [`select_tool`] combines the two into at most one tool for an invocation.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::Deserialize;

/// A valgrind tool the harness knows how to wrap a test binary with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tool {
    /// Memory error detector.
    Memcheck,
    /// Persistent memory error detector.
    Pmemcheck,
    /// Thread error detector.
    Helgrind,
    /// Data race detector.
    Drd,
}

impl Tool {
    /// All tools, in the order they are reported.
    pub const ALL: [Self; 4] = [Self::Memcheck, Self::Pmemcheck, Self::Helgrind, Self::Drd];

    /// Name passed to `valgrind --tool=`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memcheck => "memcheck",
            Self::Pmemcheck => "pmemcheck",
            Self::Helgrind => "helgrind",
            Self::Drd => "drd",
        }
    }

    /// Build the wrapped command line: `valgrind --tool=<tool> ... <program> <args>`.
    ///
    /// The tool log lands in the test's working directory as `<tool><id>.log`.
    #[must_use]
    pub fn wrap(
        self,
        valgrind: &Path,
        test_id: u32,
        program: &Path,
        args: &[OsString],
    ) -> (PathBuf, Vec<OsString>) {
        let mut wrapped = vec![
            OsString::from(format!("--tool={}", self.as_str())),
            OsString::from(format!("--log-file={}{test_id}.log", self.as_str())),
            OsString::from("--error-exitcode=99"),
            program.as_os_str().to_os_string(),
        ];
        wrapped.extend(args.iter().cloned());
        (valgrind.to_path_buf(), wrapped)
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-wide enablement policy for one tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ToolPolicy {
    /// Enable only for tests that require the tool.
    #[default]
    Auto,
    /// Enable for every test that does not explicitly disable the tool.
    ForceEnable,
}

/// A test's explicit stance on one tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolRequirement {
    /// The test must always run under this tool.
    Required,
    /// The test must never run under this tool.
    Disabled,
}

/// Policies for every tool, resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ToolPolicies {
    pub memcheck: ToolPolicy,
    pub pmemcheck: ToolPolicy,
    pub helgrind: ToolPolicy,
    pub drd: ToolPolicy,
}

impl ToolPolicies {
    /// Policy for a single tool.
    #[must_use]
    pub const fn get(&self, tool: Tool) -> ToolPolicy {
        match tool {
            Tool::Memcheck => self.memcheck,
            Tool::Pmemcheck => self.pmemcheck,
            Tool::Helgrind => self.helgrind,
            Tool::Drd => self.drd,
        }
    }

    /// Tools whose policy is `force-enable`.
    pub fn forced(&self) -> impl Iterator<Item = Tool> + '_ {
        Tool::ALL
            .into_iter()
            .filter(|tool| self.get(*tool) == ToolPolicy::ForceEnable)
    }
}

/// Per-test requirements, as declared in a test descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ToolRequirements {
    pub memcheck: Option<ToolRequirement>,
    pub pmemcheck: Option<ToolRequirement>,
    pub helgrind: Option<ToolRequirement>,
    pub drd: Option<ToolRequirement>,
}

impl ToolRequirements {
    /// Requirement for a single tool, if the test declared one.
    #[must_use]
    pub const fn get(&self, tool: Tool) -> Option<ToolRequirement> {
        match tool {
            Tool::Memcheck => self.memcheck,
            Tool::Pmemcheck => self.pmemcheck,
            Tool::Helgrind => self.helgrind,
            Tool::Drd => self.drd,
        }
    }

    /// Tools the test marks as `required`.
    pub fn required(&self) -> impl Iterator<Item = Tool> + '_ {
        Tool::ALL
            .into_iter()
            .filter(|tool| self.get(*tool) == Some(ToolRequirement::Required))
    }
}

/// Pick the tool (if any) a test invocation runs under.
///
/// A required tool always wins. Otherwise a force-enabled tool applies unless
/// the test disables it. Registration and configuration guarantee at most one
/// required and at most one forced tool.
#[must_use]
pub fn select_tool(policies: &ToolPolicies, requirements: &ToolRequirements) -> Option<Tool> {
    if let Some(tool) = requirements.required().next() {
        return Some(tool);
    }
    policies
        .forced()
        .find(|tool| requirements.get(*tool) != Some(ToolRequirement::Disabled))
}
