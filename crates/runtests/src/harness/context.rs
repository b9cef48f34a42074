//! Execution contexts: one test case paired with one build and one filesystem.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use super::case::TestCase;
use super::launcher::{Execution, Invocation};
use crate::config::Configuration;
use crate::tools::select_tool;
use crate::variant::{BuildVariant, EnvOverlay, FsVariant};

/// Placeholder in a test argument replaced by the context working directory.
pub const TESTDIR_PLACEHOLDER: &str = "{testdir}";

/// Lifecycle of a context. There are no retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Pending,
    Setup,
    Running,
    TimedOut,
    Passed,
    Failed,
    CleanedUp,
}

impl ContextState {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Setup)
                | (Self::Setup, Self::Running | Self::Failed)
                | (Self::Running, Self::TimedOut | Self::Passed | Self::Failed)
                | (
                    Self::Setup | Self::TimedOut | Self::Passed | Self::Failed,
                    Self::CleanedUp
                )
        )
    }
}

/// A test case instantiated for one (filesystem, build) pair.
#[derive(Debug)]
pub struct Context<'a> {
    test: &'a TestCase,
    build: &'a BuildVariant,
    fs: &'a FsVariant,
    config: &'a Configuration,
    workdir: Option<PathBuf>,
    state: ContextState,
    execution: Option<Execution>,
}

impl<'a> Context<'a> {
    /// `attempt` is the ordinal of the context within its test case.
    #[must_use]
    pub fn new(
        test: &'a TestCase,
        build: &'a BuildVariant,
        fs: &'a FsVariant,
        config: &'a Configuration,
        attempt: usize,
    ) -> Self {
        let workdir = fs
            .dir()
            .map(|base| base.join(format!("{}_{attempt}", test.workdir_stem())));
        Self {
            test,
            build,
            fs,
            config,
            workdir,
            state: ContextState::Pending,
            execution: None,
        }
    }

    #[must_use]
    pub const fn test(&self) -> &'a TestCase {
        self.test
    }

    #[must_use]
    pub const fn build(&self) -> &'a BuildVariant {
        self.build
    }

    #[must_use]
    pub const fn fs(&self) -> &'a FsVariant {
        self.fs
    }

    /// Working directory; `None` for tests that use no filesystem.
    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    #[must_use]
    pub const fn state(&self) -> ContextState {
        self.state
    }

    /// Result of the test binary, once it has completed.
    #[must_use]
    pub const fn execution(&self) -> Option<&Execution> {
        self.execution.as_ref()
    }

    /// `duration/fs/build`, as shown in banners.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{}/{}/{}",
            self.test.duration(),
            self.fs.kind(),
            self.build.kind()
        )
    }

    /// Move to `next`, which must be a legal successor of the current state.
    pub fn advance(&mut self, next: ContextState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal context transition {:?} -> {next:?}",
            self.state
        );
        trace!(
            test = %self.test.qualified_name(),
            from = ?self.state,
            to = ?next,
            "context state"
        );
        self.state = next;
    }

    /// Prepare a fresh working directory with the test's holey files.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a holey file cannot be created.
    pub fn setup(&mut self) -> io::Result<()> {
        self.advance(ContextState::Setup);
        let Some(dir) = &self.workdir else {
            return Ok(());
        };
        remove_dir(dir)?;
        fs::create_dir_all(dir)?;
        for file in self.test.holey_files() {
            self.create_holey_file(&file.name, file.size)?;
        }
        Ok(())
    }

    /// Create a sparse file of `size` bytes in the working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the context has no working directory or the file
    /// cannot be created.
    pub fn create_holey_file(&self, name: &str, size: u64) -> io::Result<PathBuf> {
        let dir = self.workdir.as_deref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no working directory", self.test.qualified_name()),
            )
        })?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;
        debug!(path = %path.display(), size, "created holey file");
        Ok(path)
    }

    /// The test argument with `{testdir}` expanded.
    #[must_use]
    pub fn expand_arg(&self) -> String {
        let testdir = self
            .workdir
            .as_deref()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.test.arg().replace(TESTDIR_PLACEHOLDER, &testdir)
    }

    /// Subprocess environment: process environment, then the build overlay,
    /// then the test's own variables, then the `UNITTEST_*` variables.
    #[must_use]
    pub fn environment(&self) -> EnvOverlay {
        let mut env: EnvOverlay = std::env::vars_os().collect();
        env.extend(self.build.env().clone());
        env.extend(
            self.test
                .env()
                .iter()
                .map(|(key, value)| (OsString::from(key), OsString::from(value))),
        );
        env.insert("UNITTEST_NAME".into(), self.test.qualified_name().into());
        env.insert(
            "UNITTEST_LOG_LEVEL".into(),
            self.config.unittest_log_level.to_string().into(),
        );
        env.insert("UNITTEST_NUM".into(), self.test.id().to_string().into());
        env
    }

    /// Command line, environment and cwd for the test binary.
    #[must_use]
    pub fn invocation(&self) -> Invocation {
        let binary = self.build.executable(self.test.dir(), self.test.binary());
        let args = vec![OsString::from(self.expand_arg())];

        let (program, args) = match select_tool(&self.config.tools, self.test.tools()) {
            Some(tool) if cfg!(windows) => {
                warn!(
                    %tool,
                    test = %self.test.qualified_name(),
                    "valgrind is not available on Windows"
                );
                (binary, args)
            }
            Some(tool) => tool.wrap(&self.config.valgrind, self.test.id(), &binary, &args),
            None => (binary, args),
        };

        let invocation = Invocation {
            program,
            args,
            env: self.environment(),
            cwd: self.test.dir().to_path_buf(),
        };
        debug!(
            test = %self.test.qualified_name(),
            command = %invocation.command_line(),
            "prepared invocation"
        );
        invocation
    }

    /// Keep the result of the test binary.
    pub fn record(&mut self, execution: Execution) {
        self.execution = Some(execution);
    }

    /// Remove the working directory. A missing directory is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn cleanup(&mut self) -> io::Result<()> {
        if self.state != ContextState::CleanedUp {
            self.advance(ContextState::CleanedUp);
        }
        match &self.workdir {
            Some(dir) => remove_dir(dir),
            None => Ok(()),
        }
    }
}

fn remove_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Contexts for `test`: the intersection of the selected variants with the
/// test's restrictions, filesystem-major.
#[must_use]
pub fn build_contexts<'a>(config: &'a Configuration, test: &'a TestCase) -> Vec<Context<'a>> {
    let builds: Vec<&BuildVariant> = config
        .catalog
        .available_builds()
        .iter()
        .filter(|build| test.builds().is_none_or(|only| only.contains(&build.kind())))
        .collect();
    let filesystems = config
        .catalog
        .available_filesystems()
        .iter()
        .filter(|fs| test.filesystems().is_none_or(|only| only.contains(&fs.kind())));

    let mut contexts = Vec::new();
    for fs in filesystems {
        for &build in &builds {
            let attempt = contexts.len();
            contexts.push(Context::new(test, build, fs, config, attempt));
        }
    }
    contexts
}
