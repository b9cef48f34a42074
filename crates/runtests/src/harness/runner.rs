//! The execution engine.
//!
//! [`Engine::run`] walks the registry in discovery order, filters test cases
//! by group, sequence, name and duration, and drives every context through
//! setup, run, check and cleanup. A failure stops the run unless keep-going
//! is set.

use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use super::context::{Context, ContextState, build_contexts};
use super::launcher::{Execution, Launch, Launcher};
use super::matcher::Matcher;
use super::registry::Registry;
use super::report::Reporter;
use crate::config::Configuration;
use crate::variant::{BuildKind, DurationTag, FsKind};

/// Final outcome of one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed {
        /// Short description, e.g. `exit code 1`.
        reason: String,
        /// Captured output of the test or the match tool.
        diagnostic: String,
    },
    /// The test binary exceeded the timeout. Counted as skipped.
    TimedOut,
}

impl Outcome {
    fn failed(reason: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            diagnostic: diagnostic.into(),
        }
    }

    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// What happened to one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRecord {
    /// `<group>/TEST<n>`.
    pub test: String,
    pub id: u32,
    pub duration: DurationTag,
    pub fs: FsKind,
    pub build: BuildKind,
    pub outcome: Outcome,
    /// When the test binary started, if it did.
    pub started: Option<DateTime<Local>>,
    /// Wall-clock time from setup through cleanup.
    pub elapsed: Duration,
}

impl ContextRecord {
    /// `duration/fs/build`.
    #[must_use]
    pub fn variants(&self) -> String {
        format!("{}/{}/{}", self.duration, self.fs, self.build)
    }
}

/// Aggregate result of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    /// Contexts attempted.
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Contexts that timed out.
    pub skipped: usize,
    /// Per-context records in execution order.
    pub records: Vec<ContextRecord>,
    pub duration: Duration,
    /// A failure stopped the run early.
    pub aborted: bool,
}

impl RunResult {
    fn push(&mut self, record: ContextRecord) {
        self.total += 1;
        match record.outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::TimedOut => self.skipped += 1,
        }
        self.records.push(record);
    }

    /// No context failed. Timeouts do not count as failures.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.failed == 0
    }

    /// Process exit status for this result.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.success() { 0 } else { 1 }
    }
}

/// Runs registered test cases under one configuration.
pub struct Engine<'a> {
    config: &'a Configuration,
    registry: &'a Registry,
    launcher: &'a dyn Launcher,
    reporter: Reporter,
}

impl<'a> Engine<'a> {
    #[must_use]
    pub fn new(
        config: &'a Configuration,
        registry: &'a Registry,
        launcher: &'a dyn Launcher,
    ) -> Self {
        Self {
            config,
            registry,
            launcher,
            reporter: Reporter::stdout(true).with_time(config.show_time),
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter.with_time(self.config.show_time);
        self
    }

    /// Run every selected context and report the totals.
    pub fn run(&mut self) -> RunResult {
        let config = self.config;
        let registry = self.registry;
        let start = Instant::now();
        let mut result = RunResult::default();

        'tests: for test in registry.test_cases() {
            if !config.selects_group(test.group())
                || !config.selects_test(test.id(), test.name())
            {
                continue;
            }
            if !config.catalog.admits(test.duration()) {
                debug!(
                    test = %test.qualified_name(),
                    duration = %test.duration(),
                    "duration not selected"
                );
                continue;
            }
            let contexts = build_contexts(config, test);
            if contexts.is_empty() {
                debug!(test = %test.qualified_name(), "no matching build and filesystem");
                continue;
            }

            for mut ctx in contexts {
                let record = self.execute(&mut ctx);
                let failed = record.outcome.is_failure();
                result.push(record);
                if failed && !config.keep_going {
                    info!(test = %test.qualified_name(), "stopping after failure");
                    result.aborted = true;
                    break 'tests;
                }
            }
        }

        result.duration = start.elapsed();
        self.reporter.summary(&result);
        result
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> ContextRecord {
        let test = ctx.test();
        let name = test.qualified_name();
        self.reporter.setup(&name, &ctx.describe());
        let clock = Instant::now();

        let outcome = match ctx.setup() {
            Ok(()) => self.run_and_check(ctx),
            Err(err) => {
                ctx.advance(ContextState::Failed);
                Outcome::failed("setup failed", err.to_string())
            }
        };

        if let Err(err) = ctx.cleanup() {
            warn!(test = %name, error = %err, "cannot remove working directory");
        }

        match &outcome {
            Outcome::Passed => {
                let elapsed = ctx.execution().map_or_else(|| clock.elapsed(), |e| e.elapsed);
                self.reporter.passed(&name, elapsed);
            }
            Outcome::Failed { diagnostic, .. } => self.reporter.failed(&name, diagnostic),
            Outcome::TimedOut => self.reporter.timed_out(&name),
        }

        ContextRecord {
            test: name,
            id: test.id(),
            duration: test.duration(),
            fs: ctx.fs().kind(),
            build: ctx.build().kind(),
            outcome,
            started: ctx.execution().map(|execution| execution.started),
            elapsed: clock.elapsed(),
        }
    }

    fn run_and_check(&self, ctx: &mut Context<'_>) -> Outcome {
        ctx.advance(ContextState::Running);
        let invocation = ctx.invocation();

        match self.launcher.launch(&invocation, Some(self.config.timeout)) {
            Err(err) => {
                ctx.advance(ContextState::Failed);
                Outcome::failed("cannot run test binary", err.to_string())
            }
            Ok(Launch::TimedOut { elapsed, .. }) => {
                warn!(
                    test = %ctx.test().qualified_name(),
                    timeout = ?self.config.timeout,
                    elapsed = ?elapsed,
                    "test timed out"
                );
                ctx.advance(ContextState::TimedOut);
                Outcome::TimedOut
            }
            Ok(Launch::Completed(execution)) => {
                let outcome = self.check(ctx, &execution);
                ctx.record(execution);
                ctx.advance(if outcome.is_failure() {
                    ContextState::Failed
                } else {
                    ContextState::Passed
                });
                outcome
            }
        }
    }

    fn check(&self, ctx: &Context<'_>, execution: &Execution) -> Outcome {
        if !execution.success() {
            let reason = execution.exit_code.map_or_else(
                || "killed by signal".to_string(),
                |code| format!("exit code {code}"),
            );
            return Outcome::failed(reason, execution.output.clone());
        }
        if !ctx.test().match_output() {
            return Outcome::Passed;
        }

        let matcher = Matcher::new(&self.config.match_tool, self.launcher)
            .with_timeout(self.config.timeout);
        match matcher.check(ctx.test()) {
            Ok(result) if result.file.is_none() => Outcome::failed(
                "no match files",
                format!("no match files for {}", ctx.test().name()),
            ),
            Ok(result) if result.matched => Outcome::Passed,
            Ok(result) => Outcome::failed("output mismatch", result.output),
            Err(err) => Outcome::failed("cannot run match tool", err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::path::{Path, PathBuf};

    use parking_lot::Mutex;

    use super::*;
    use crate::config::{Settings, resolve};
    use crate::harness::case::TestDescriptor;
    use crate::harness::launcher::{Invocation, LaunchError};
    use crate::harness::report::SharedBuffer;

    struct Fixture {
        _pmem: tempfile::TempDir,
        _nonpmem: tempfile::TempDir,
        tests: tempfile::TempDir,
        config: Configuration,
    }

    impl Fixture {
        fn new(builds: &[&str], keep_going: bool) -> Self {
            let pmem = tempfile::tempdir().unwrap();
            let nonpmem = tempfile::tempdir().unwrap();
            let tests = tempfile::tempdir().unwrap();
            let settings = Settings {
                build_type: Some(builds.iter().map(|b| (*b).to_string()).collect()),
                pmem_fs_dir: Some(pmem.path().to_path_buf()),
                non_pmem_fs_dir: Some(nonpmem.path().to_path_buf()),
                rootdir: Some(tests.path().to_path_buf()),
                keep_going: Some(keep_going),
                timeout: Some("5s".to_string()),
                ..Settings::default()
            };
            let config = resolve(Settings::defaults(), settings, Settings::default()).unwrap();
            Self {
                _pmem: pmem,
                _nonpmem: nonpmem,
                tests,
                config,
            }
        }

        fn group_dir(&self, group: &str) -> PathBuf {
            let dir = self.tests.path().join(group);
            std::fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn registry(&self, descriptors: Vec<(&str, TestDescriptor)>) -> Registry {
            let mut registry = Registry::new();
            for (group, descriptor) in descriptors {
                let dir = self.group_dir(group);
                registry.register(group, &dir, descriptor).unwrap();
            }
            registry
        }
    }

    fn short(name: &str) -> TestDescriptor {
        TestDescriptor {
            duration: DurationTag::Short,
            match_output: false,
            ..TestDescriptor::new(name, "unit")
        }
    }

    fn completed(code: i32, output: &str) -> Result<Launch, LaunchError> {
        Ok(Launch::Completed(Execution {
            exit_code: Some(code),
            output: output.to_string(),
            started: Local::now(),
            finished: Local::now(),
            elapsed: Duration::from_millis(5),
        }))
    }

    fn env_var(invocation: &Invocation, key: &str) -> String {
        invocation
            .env
            .get(&OsString::from(key))
            .map(|value| value.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn run(
        fixture: &Fixture,
        registry: &Registry,
        launcher: &dyn Launcher,
    ) -> (RunResult, SharedBuffer) {
        let (reporter, buffer) = Reporter::buffered();
        let result = Engine::new(&fixture.config, registry, launcher)
            .with_reporter(reporter)
            .run();
        (result, buffer)
    }

    #[test]
    fn single_passing_context() {
        let fixture = Fixture::new(&["debug"], false);
        let registry = fixture.registry(vec![(
            "obj_basic",
            TestDescriptor {
                fs: Some(vec!["pmem".to_string()]),
                ..short("TEST0")
            },
        )]);
        let launcher = |_: &Invocation, _: Option<Duration>| completed(0, "");

        let (result, buffer) = run(&fixture, &registry, &launcher);

        assert_eq!((result.total, result.passed, result.failed), (1, 1, 0));
        assert_eq!(result.exit_code(), 0);
        let output = buffer.contents();
        assert!(output.contains("obj_basic/TEST0: SETUP (short/pmem/debug)"));
        assert!(output.contains("obj_basic/TEST0: PASS"));
    }

    #[test]
    fn failure_aborts_without_keep_going() {
        let fixture = Fixture::new(&["debug"], false);
        let registry = fixture.registry(vec![
            ("obj_basic", short("TEST0")),
            ("obj_basic", short("TEST1")),
        ]);
        let calls = Mutex::new(0);
        let launcher = |_: &Invocation, _: Option<Duration>| {
            *calls.lock() += 1;
            completed(1, "boom\n")
        };

        let (result, buffer) = run(&fixture, &registry, &launcher);

        assert_eq!(*calls.lock(), 1);
        assert!(result.aborted);
        assert_eq!((result.total, result.failed), (1, 1));
        assert_ne!(result.exit_code(), 0);
        let output = buffer.contents();
        assert!(output.contains("boom\nobj_basic/TEST0: FAILED"));
        assert!(!output.contains("TEST1"));
    }

    #[test]
    fn keep_going_runs_everything_but_still_fails() {
        let fixture = Fixture::new(&["debug"], true);
        let registry = fixture.registry(vec![
            ("obj_basic", short("TEST0")),
            ("obj_basic", short("TEST1")),
        ]);
        let launcher = |invocation: &Invocation, _: Option<Duration>| {
            let code = i32::from(env_var(invocation, "UNITTEST_NUM") == "0");
            completed(code, "")
        };

        let (result, _) = run(&fixture, &registry, &launcher);

        // Two filesystems per test, test 0 fails on both.
        assert_eq!((result.total, result.passed, result.failed), (4, 2, 2));
        assert!(!result.aborted);
        assert_eq!(result.exit_code(), 1);
    }

    #[test]
    fn timeout_is_a_skip_and_the_run_continues() {
        let fixture = Fixture::new(&["debug"], false);
        let registry = fixture.registry(vec![
            (
                "obj_basic",
                TestDescriptor {
                    fs: Some(vec!["pmem".to_string()]),
                    ..short("TEST0")
                },
            ),
            (
                "obj_basic",
                TestDescriptor {
                    fs: Some(vec!["pmem".to_string()]),
                    ..short("TEST1")
                },
            ),
        ]);
        let launcher = |invocation: &Invocation, timeout: Option<Duration>| {
            assert_eq!(timeout, Some(Duration::from_secs(5)));
            if env_var(invocation, "UNITTEST_NUM") == "0" {
                Ok(Launch::TimedOut {
                    started: Local::now(),
                    elapsed: Duration::from_secs(5),
                })
            } else {
                completed(0, "")
            }
        };

        let (result, buffer) = run(&fixture, &registry, &launcher);

        assert_eq!(
            (result.total, result.passed, result.failed, result.skipped),
            (2, 1, 0, 1)
        );
        assert_eq!(result.records[0].outcome, Outcome::TimedOut);
        assert_eq!(result.exit_code(), 0);
        assert!(buffer.contents().contains("Skipping: obj_basic/TEST0 timed out"));
    }

    #[test]
    fn filesystem_restriction_limits_contexts() {
        let fixture = Fixture::new(&["debug", "release"], false);
        let registry = fixture.registry(vec![(
            "obj_basic",
            TestDescriptor {
                fs: Some(vec!["nonpmem".to_string()]),
                ..short("TEST0")
            },
        )]);
        let launcher = |_: &Invocation, _: Option<Duration>| completed(0, "");

        let (result, _) = run(&fixture, &registry, &launcher);

        let pairs: Vec<_> = result.records.iter().map(|r| (r.fs, r.build)).collect();
        assert_eq!(
            pairs,
            vec![
                (FsKind::NonPmem, BuildKind::Debug),
                (FsKind::NonPmem, BuildKind::Release),
            ]
        );
    }

    #[test]
    fn long_tests_are_skipped_silently_under_check() {
        let fixture = Fixture::new(&["debug"], false);
        let registry = fixture.registry(vec![(
            "obj_basic",
            TestDescriptor {
                duration: DurationTag::Long,
                ..short("TEST0")
            },
        )]);
        let launcher = |_: &Invocation, _: Option<Duration>| -> Result<Launch, LaunchError> {
            panic!("long test must not run")
        };

        let (result, buffer) = run(&fixture, &registry, &launcher);

        assert_eq!(result.total, 0);
        assert!(!buffer.contents().contains("SETUP"));
    }

    #[test]
    fn group_and_sequence_filters() {
        let mut fixture = Fixture::new(&["debug"], true);
        fixture.config.groups = vec!["pmem2_map".to_string()];
        fixture.config.test_sequence = [1].into_iter().collect();
        let registry = fixture.registry(vec![
            ("obj_basic", short("TEST1")),
            ("pmem2_map", short("TEST0")),
            ("pmem2_map", short("TEST1")),
        ]);
        let seen = Mutex::new(Vec::new());
        let launcher = |invocation: &Invocation, _: Option<Duration>| {
            seen.lock().push(env_var(invocation, "UNITTEST_NAME"));
            completed(0, "")
        };

        run(&fixture, &registry, &launcher);

        assert_eq!(*seen.lock(), vec!["pmem2_map/TEST1", "pmem2_map/TEST1"]);
    }

    #[test]
    fn mismatch_fails_with_match_tool_output() {
        let fixture = Fixture::new(&["debug"], false);
        let dir = fixture.group_dir("obj_basic");
        std::fs::write(dir.join("out0.log.match"), "expected\n").unwrap();
        let registry = fixture.registry(vec![(
            "obj_basic",
            TestDescriptor {
                match_output: true,
                fs: Some(vec!["pmem".to_string()]),
                ..short("TEST0")
            },
        )]);
        let match_tool = fixture.config.match_tool.clone();
        let launcher = move |invocation: &Invocation, _: Option<Duration>| {
            if invocation.program == match_tool {
                completed(1, "line 1: expected 'expected'\n")
            } else {
                completed(0, "")
            }
        };

        let (result, buffer) = run(&fixture, &registry, &launcher);

        assert_eq!(result.failed, 1);
        assert!(matches!(
            &result.records[0].outcome,
            Outcome::Failed { reason, diagnostic }
                if reason == "output mismatch" && diagnostic.contains("line 1")
        ));
        assert!(buffer.contents().contains("obj_basic/TEST0: FAILED"));
    }

    #[test]
    fn required_match_without_match_files_fails() {
        let fixture = Fixture::new(&["debug"], false);
        let registry = fixture.registry(vec![(
            "obj_basic",
            TestDescriptor {
                match_output: true,
                fs: Some(vec!["pmem".to_string()]),
                ..short("TEST0")
            },
        )]);
        let match_tool = fixture.config.match_tool.clone();
        let launcher = move |invocation: &Invocation, _: Option<Duration>| {
            assert_ne!(invocation.program, match_tool, "nothing to match against");
            completed(0, "")
        };

        let (result, buffer) = run(&fixture, &registry, &launcher);

        assert_eq!((result.total, result.passed, result.failed), (1, 0, 1));
        assert_eq!(result.exit_code(), 1);
        assert!(matches!(
            &result.records[0].outcome,
            Outcome::Failed { reason, diagnostic }
                if reason == "no match files" && diagnostic == "no match files for TEST0"
        ));
        let output = buffer.contents();
        assert!(output.contains("no match files for TEST0\nobj_basic/TEST0: FAILED"));
    }

    #[cfg(unix)]
    #[test]
    fn cleanup_failure_keeps_the_outcome() {
        let fixture = Fixture::new(&["debug"], false);
        let registry = fixture.registry(vec![(
            "obj_basic",
            TestDescriptor {
                arg: "{testdir}".to_string(),
                fs: Some(vec!["pmem".to_string()]),
                ..short("TEST0")
            },
        )]);
        // Replace the working directory with a plain file so removing it fails.
        let launcher = |invocation: &Invocation, _: Option<Duration>| {
            let dir = PathBuf::from(&invocation.args[0]);
            std::fs::remove_dir_all(&dir).unwrap();
            std::fs::write(&dir, "not a directory").unwrap();
            completed(0, "")
        };

        let (result, buffer) = run(&fixture, &registry, &launcher);

        assert_eq!((result.total, result.passed, result.failed), (1, 1, 0));
        assert_eq!(result.records[0].outcome, Outcome::Passed);
        assert!(buffer.contents().contains("obj_basic/TEST0: PASS"));
    }

    #[test]
    fn working_directory_is_removed_after_each_context() {
        let fixture = Fixture::new(&["debug"], false);
        let registry = fixture.registry(vec![(
            "obj_basic",
            TestDescriptor {
                arg: "{testdir}".to_string(),
                fs: Some(vec!["pmem".to_string()]),
                ..short("TEST3")
            },
        )]);
        let workdirs = Mutex::new(Vec::new());
        let launcher = |invocation: &Invocation, _: Option<Duration>| {
            let dir = PathBuf::from(&invocation.args[0]);
            assert!(dir.is_dir(), "working directory exists while the test runs");
            workdirs.lock().push(dir);
            completed(0, "")
        };

        run(&fixture, &registry, &launcher);

        let workdirs = workdirs.lock();
        assert_eq!(workdirs.len(), 1);
        assert!(workdirs[0].ends_with(Path::new("obj_basic_3_0")));
        assert!(!workdirs[0].exists());
    }
}
