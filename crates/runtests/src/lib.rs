#![forbid(unsafe_code)]

//! # runtests
//!
//! Runs native unit test binaries across a matrix of build variants,
//! filesystem variants and duration classes.
//!
//! A run resolves a [`Configuration`] from defaults, a settings file and the
//! command line, discovers test cases from `TESTS.toml` descriptors into a
//! [`Registry`], and hands both to the [`Engine`]. Every test case is
//! expanded into one context per selected (filesystem, build) pair; each
//! context gets its own working directory, runs the test binary under a
//! timeout and checks its exit status and output.
//!
//! ## Modules
//!
//! - [`config`] - Settings layers and the resolved configuration
//! - [`variant`] - Build, filesystem and duration variants
//! - [`tools`] - Valgrind instrumentation
//! - [`harness`] - Discovery, contexts, execution and reporting
//! - [`cli`] - Command-line interface
//! - [`logging`] - Diagnostic logging setup
//!
//! ## Example
//!
//! ```rust,ignore
//! use runtests::{Engine, ProcessLauncher, Registry, Settings, config, discover};
//!
//! let file = Settings::load_file(None, &std::env::current_dir()?)?;
//! let config = config::resolve(Settings::defaults(), file, Settings::default())?;
//! let mut registry = Registry::new();
//! discover(&config.root_dir, &mut registry)?;
//! let launcher = ProcessLauncher::new()?;
//! let result = Engine::new(&config, &registry, &launcher).run();
//! std::process::exit(i32::from(result.exit_code()));
//! ```

pub mod cli;
pub mod config;
pub mod harness;
pub mod logging;
pub mod tools;
pub mod variant;

pub use config::{ConfigError, Configuration, Settings};
pub use harness::{
    Engine, Outcome, ProcessLauncher, Registry, RegistrationError, RunResult, discover,
};
pub use tools::{Tool, ToolPolicy, ToolRequirement};
pub use variant::{BuildKind, Catalog, DurationClass, DurationTag, FsKind};
