use std::env;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Builder;

use vmdriver::{Config, Driver};

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
    /// Don't tear down each machine's state directory before starting.
    ///
    /// Without this, every run starts from a clean state_dir; with it, a
    /// previous run's sockets and any files a test left behind in the
    /// shared directory are preserved across invocations.
    #[clap(short = 'K', long)]
    keep_vm_state: bool,
    /// A `vmdriver.toml` matrix describing several machines at once.
    /// Conflicts with positional start commands.
    #[clap(short = 'c', long, conflicts_with = "start_commands")]
    config: Option<PathBuf>,
    /// A scripting-DSL source file to run instead of the `tests` environment
    /// variable.
    #[clap(long)]
    script: Option<PathBuf>,
    /// Verbatim startup command for each machine to run, one per argument.
    start_commands: Vec<String>,
}

fn init_logging() -> Result<()> {
    Builder::from_default_env()
        .default_format()
        .try_init()
        .context("failed to init env_logger")
}

fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging() {
        eprintln!("{e:#}");
        exit(1);
    }

    match run(args) {
        Ok(()) => exit(0),
        Err(e) => {
            log::error!("{e:#}");
            exit(1);
        }
    }
}

fn run(args: Args) -> Result<()> {
    let base_dir: PathBuf = env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));

    let driver = match args.config {
        Some(path) => {
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let config: Config = toml::from_str(&source)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            Driver::new(config, &base_dir, args.keep_vm_state)
        }
        None => Driver::from_start_commands(args.start_commands, &base_dir, args.keep_vm_state),
    }
    .context("failed to set up driver")?;

    let script = match args.script {
        Some(path) => Some(
            std::fs::read_to_string(&path)
                .with_context(|| format!("reading script file {}", path.display()))?,
        ),
        None => env::var("tests").ok(),
    };

    match script {
        Some(script) => driver.run(|driver| vmdriver::dsl::run_script(driver, &script)),
        None => driver.run(|driver| {
            log::info!("no script supplied; booting every machine and waiting for shutdown");
            for machine in driver.machines() {
                machine.start()?;
            }
            for machine in driver.machines() {
                machine.wait_for_shutdown()?;
            }
            Ok(())
        }),
    }
}
