//! Output verification through an external match tool.
//!
//! A test that leaves log files behind is verified by `<id>.log.match`
//! patterns in its directory. The match tool is run once per candidate as
//! `<tool> <match-file>` and the first result decides.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::case::TestCase;
use super::launcher::{Invocation, Launch, Launcher};

/// Suffix of match files, after the test id.
pub const MATCH_SUFFIX: &str = ".log.match";

/// Whether `file_name` is a match file for test `id`.
///
/// `out1.log.match` belongs to test 1, `out11.log.match` does not.
#[must_use]
pub fn is_match_file(file_name: &str, id: u32) -> bool {
    file_name
        .strip_suffix(&format!("{id}{MATCH_SUFFIX}"))
        .is_some_and(|prefix| !prefix.ends_with(|c: char| c.is_ascii_digit()))
}

/// Match files for test `id` in `dir`, sorted by name.
///
/// # Errors
///
/// Returns an error if `dir` cannot be listed.
pub fn match_files(dir: &Path, id: u32) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if is_match_file(&entry.file_name().to_string_lossy(), id) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Result of verifying one test's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: bool,
    /// Output of the match tool; empty when there was nothing to match.
    pub output: String,
    /// Match file that decided the result; `None` when there was none.
    pub file: Option<PathBuf>,
}

impl MatchResult {
    const fn vacuous() -> Self {
        Self {
            matched: true,
            output: String::new(),
            file: None,
        }
    }
}

/// Runs the match tool through a [`Launcher`].
pub struct Matcher<'a> {
    tool: &'a Path,
    launcher: &'a dyn Launcher,
    timeout: Option<Duration>,
}

impl<'a> Matcher<'a> {
    #[must_use]
    pub fn new(tool: &'a Path, launcher: &'a dyn Launcher) -> Self {
        Self {
            tool,
            launcher,
            timeout: None,
        }
    }

    /// Bound each match tool run.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Verify `test`'s output against its match files.
    ///
    /// Without match files the result is a vacuous match with no `file`;
    /// callers that require matching treat that as a failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the test directory cannot be listed or the match
    /// tool cannot be run or times out.
    pub fn check(&self, test: &TestCase) -> io::Result<MatchResult> {
        let files = match_files(test.dir(), test.id())?;
        let Some(file) = files.into_iter().next() else {
            debug!(test = %test.qualified_name(), "no match files");
            return Ok(MatchResult::vacuous());
        };

        let invocation = self.invocation(&file, test.dir());
        debug!(test = %test.qualified_name(), file = %file.display(), "matching output");
        match self.launcher.launch(&invocation, self.timeout)? {
            Launch::Completed(execution) => Ok(MatchResult {
                matched: execution.success(),
                output: execution.output,
                file: Some(file),
            }),
            Launch::TimedOut { .. } => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("match tool timed out on {}", file.display()),
            )),
        }
    }

    fn invocation(&self, file: &Path, cwd: &Path) -> Invocation {
        let file = OsString::from(file.as_os_str());
        if cfg!(windows) {
            let tool = self.tool.as_os_str().to_os_string();
            Invocation::inheriting("perl", vec![tool, file], cwd)
        } else {
            Invocation::inheriting(self.tool, vec![file], cwd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::case::TestDescriptor;
    use crate::harness::launcher::{Execution, LaunchError};
    use chrono::Local;
    use parking_lot::Mutex;

    fn test_in(dir: &Path, name: &str) -> TestCase {
        TestCase::from_descriptor("obj_basic", dir, TestDescriptor::new(name, "obj_basic"))
            .unwrap()
    }

    fn exiting(code: i32, output: &str) -> Launch {
        Launch::Completed(Execution {
            exit_code: Some(code),
            output: output.to_string(),
            started: Local::now(),
            finished: Local::now(),
            elapsed: Duration::ZERO,
        })
    }

    #[test]
    fn suffix_must_not_follow_a_digit() {
        assert!(is_match_file("out1.log.match", 1));
        assert!(is_match_file("1.log.match", 1));
        assert!(is_match_file("pmemcheck1.log.match", 1));
        assert!(!is_match_file("out11.log.match", 1));
        assert!(!is_match_file("out1.log.match", 11));
        assert!(!is_match_file("out1.log", 1));
    }

    #[test]
    fn candidates_are_sorted_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["out0.log.match", "err0.log.match", "out10.log.match", "out0.log"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::create_dir(dir.path().join("dir0.log.match")).unwrap();

        let files = match_files(dir.path(), 0).unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("err0.log.match"),
                dir.path().join("out0.log.match"),
            ]
        );
    }

    #[test]
    fn no_candidates_is_a_pass() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = |_: &Invocation, _: Option<Duration>| -> Result<Launch, LaunchError> {
            panic!("match tool must not run")
        };
        let result = Matcher::new(Path::new("match"), &launcher)
            .check(&test_in(dir.path(), "TEST0"))
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.file, None);
    }

    #[test]
    fn first_candidate_decides() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("err2.log.match"), "").unwrap();
        fs::write(dir.path().join("out2.log.match"), "").unwrap();

        let calls = Mutex::new(Vec::new());
        let launcher = |invocation: &Invocation, _: Option<Duration>| {
            calls.lock().push(invocation.clone());
            Ok::<_, LaunchError>(exiting(1, "line 3 differs\n"))
        };
        let result = Matcher::new(Path::new("/src/test/match"), &launcher)
            .check(&test_in(dir.path(), "TEST2"))
            .unwrap();

        assert!(!result.matched);
        assert_eq!(result.output, "line 3 differs\n");
        assert_eq!(result.file, Some(dir.path().join("err2.log.match")));

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].cwd, dir.path());
    }
}
