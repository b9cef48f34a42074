#![forbid(unsafe_code)]

//! # runtests
//!
//! Runs the unit test matrix described by `TESTS.toml` files.
//!
//! Exit status is 0 when no context failed, 1 when one did, and 2 when the
//! configuration or a test descriptor is invalid.

use std::process::ExitCode;

use anyhow::Context as _;
use tracing::debug;

use runtests::cli::Cli;
use runtests::harness::{Engine, ProcessLauncher, Registry, Reporter, discover};
use runtests::{Settings, config, logging};

const EXIT_USAGE: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    logging::init(cli.log_level());

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("runtests: {err:#}");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<u8> {
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let file = Settings::load_file(cli.config.as_deref(), &cwd)?;
    let config = config::resolve(Settings::defaults(), file, cli.to_settings())
        .context("invalid configuration")?;
    debug!("configuration:\n{}", config.to_diagnostic_string());

    let mut registry = Registry::new();
    discover(&config.root_dir, &mut registry)
        .with_context(|| format!("cannot load tests from {}", config.root_dir.display()))?;

    let launcher = ProcessLauncher::new()?;
    let reporter = Reporter::stdout(cli.use_color());
    let result = Engine::new(&config, &registry, &launcher)
        .with_reporter(reporter)
        .run();
    Ok(result.exit_code())
}
