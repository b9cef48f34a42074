//! Command-line interface for `runtests`.
//!
//! Every option maps onto a key of the settings file. Options that are not
//! given leave the key unset, so the settings file or the built-in default
//! applies.
//!
//! # Examples
//!
//! ```bash
//! # Everything selected by testconfig.toml
//! runtests
//!
//! # Two groups, release and debug builds, pmem only
//! runtests -b debug,release -f pmem obj_basic pmem2_map
//!
//! # Tests 0 to 3 of one group under memcheck, continuing after failures
//! runtests -u 0-3 -m force-enable -k obj_basic
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

use crate::config::Settings;
use crate::logging;
use crate::tools::ToolPolicy;

/// Run native unit tests across build and filesystem variants.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "runtests",
    author,
    version,
    about = "Run native unit tests across build and filesystem variants"
)]
pub struct Cli {
    /// Test groups (directory names) to run; all groups when omitted
    pub groups: Vec<String>,

    /// Build variants: debug, release, static-debug, static-release
    #[arg(long, short = 'b', value_delimiter = ',')]
    pub build_type: Vec<String>,

    /// Filesystem variants: pmem, nonpmem, none, any, all
    #[arg(long, short = 'f', value_delimiter = ',')]
    pub fs_type: Vec<String>,

    /// Duration classes: short, medium, long, check, all
    #[arg(long, short = 't', value_delimiter = ',')]
    pub test_type: Vec<String>,

    /// Run a single test case, e.g. TEST2
    #[arg(long, short = 's')]
    pub test_case: Option<String>,

    /// Test numbers to run, e.g. 0-3,6
    #[arg(long, short = 'u')]
    pub test_sequence: Option<String>,

    /// Per-context timeout with unit suffix: s, m, h or d
    #[arg(long, short = 'o')]
    pub timeout: Option<String>,

    /// Continue after a failed context
    #[arg(long, short = 'k')]
    pub keep_going: bool,

    /// Stop at the first failed context, overriding the settings file
    #[arg(long, conflicts_with = "keep_going")]
    pub no_keep_going: bool,

    /// Memcheck policy
    #[arg(long, short = 'm', value_enum)]
    pub memcheck: Option<ToolPolicy>,

    /// Pmemcheck policy
    #[arg(long, short = 'p', value_enum)]
    pub pmemcheck: Option<ToolPolicy>,

    /// Helgrind policy
    #[arg(long, short = 'e', value_enum)]
    pub helgrind: Option<ToolPolicy>,

    /// DRD policy
    #[arg(long, short = 'd', value_enum)]
    pub drd: Option<ToolPolicy>,

    /// Show elapsed time of passed contexts
    #[arg(long)]
    pub time: bool,

    /// Settings file; defaults to ./testconfig.toml when present
    #[arg(long, env = "RUNTESTS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory searched for TESTS.toml descriptors
    #[arg(long)]
    pub root_dir: Option<PathBuf>,

    /// Force color output off
    ///
    /// Respects `NO_COLOR` environment variable
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    /// Enable verbose logging
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Parse command line arguments.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create CLI from iterator (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if argument parsing fails.
    pub fn try_parse_from<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(iter)
    }

    /// The command line as the highest-precedence settings layer.
    #[must_use]
    pub fn to_settings(&self) -> Settings {
        let names = |values: &[String]| (!values.is_empty()).then(|| values.to_vec());
        Settings {
            build_type: names(&self.build_type),
            fs_type: names(&self.fs_type),
            test_type: names(&self.test_type),
            test_sequence: self.test_sequence.clone(),
            test_case: self.test_case.clone(),
            groups: names(&self.groups),
            timeout: self.timeout.clone(),
            keep_going: if self.keep_going {
                Some(true)
            } else if self.no_keep_going {
                Some(false)
            } else {
                None
            },
            rootdir: self.root_dir.clone(),
            time: self.time.then_some(true),
            memcheck: self.memcheck,
            pmemcheck: self.pmemcheck,
            helgrind: self.helgrind,
            drd: self.drd,
            ..Settings::default()
        }
    }

    /// Check if colors should be used.
    #[must_use]
    pub const fn use_color(&self) -> bool {
        !self.no_color
    }

    /// Get log level based on verbosity.
    #[must_use]
    pub const fn log_level(&self) -> Level {
        logging::level_for(self.verbose)
    }
}
