//! Test discovery and execution.
//!
//! - [`registry`] - `TESTS.toml` discovery into an explicit [`Registry`]
//! - [`case`] - Validated test cases and the descriptor format
//! - [`context`] - Test × build × filesystem contexts and their working directories
//! - [`launcher`] - Timeout-bounded subprocess execution
//! - [`matcher`] - Output verification via `<id>.log.match` files
//! - [`runner`] - The [`Engine`] and its [`RunResult`]
//! - [`report`] - Console banners

pub mod case;
pub mod context;
pub mod launcher;
pub mod matcher;
pub mod registry;
pub mod report;
pub mod runner;

pub use case::{HoleyFile, TestCase, TestDescriptor};
pub use context::{Context, ContextState, build_contexts};
pub use launcher::{Execution, Invocation, Launch, LaunchError, Launcher, ProcessLauncher};
pub use matcher::{MatchResult, Matcher};
pub use registry::{Registry, RegistrationError, discover};
pub use report::{Reporter, SharedBuffer};
pub use runner::{ContextRecord, Engine, Outcome, RunResult};
