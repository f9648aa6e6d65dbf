mod download;
mod error;
mod exec;
mod fsutil;
mod handler;
mod migrate;
mod seqnum;
mod settings;
mod status;

use clap::Parser;
use download::HttpFetcher;
use error::HandlerError;
use handler::{dispatch, Cmd, CommandTable, HandlerContext, Layout, Outcome};
use settings::{HandlerEnvironment, HANDLER_ENV_FILE};
use status::FileStatusReporter;
use std::env;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "script-handler", version, about = "Extension lifecycle handler")]
struct Cli {
    #[arg(long, hide = true)]
    handler_env: Option<PathBuf>,
    #[arg(long, hide = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, hide = true)]
    legacy_data_dir: Option<PathBuf>,
    /// install, uninstall, enable, update or disable
    command: String,
}

fn main() -> Result<(), HandlerError> {
    init_tracing();
    let cli = Cli::parse();

    if let Err(err) = run(&cli) {
        error!(event = "fatal", operation = %cli.command, error = %err);
        eprintln!("{err}");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();
}

fn run(cli: &Cli) -> Result<(), HandlerError> {
    let table = CommandTable::standard();
    let cmd = table.get(&cli.command)?;

    let env_path = resolve_handler_env(cli.handler_env.as_ref())?;
    let handler_env = HandlerEnvironment::load(&env_path)?;
    info!(
        event = "loaded handler environment",
        path = %env_path.display(),
        name = %handler_env.name,
        version = handler_env.version,
        log_folder = %handler_env.folders.log_folder.display(),
        heartbeat = ?handler_env.folders.heartbeat_file
    );

    let seq = resolve_seq_num(cmd, &handler_env)?;
    let fetcher = HttpFetcher::new()?;
    let ctx = HandlerContext {
        layout: Layout {
            data_dir: resolve_dir(cli.data_dir.as_ref(), "SCRIPT_HANDLER_DATA_DIR", handler::DATA_DIR),
            legacy_data_dir: resolve_dir(
                cli.legacy_data_dir.as_ref(),
                "SCRIPT_HANDLER_LEGACY_DATA_DIR",
                handler::LEGACY_DATA_DIR,
            ),
        },
        cert_dir: settings::cert_dir(),
        fetcher: &fetcher,
    };
    let reporter = FileStatusReporter::new(
        handler_env.folders.status_folder.clone(),
        handler_env.name.clone(),
    );

    match dispatch(cmd, &ctx, &handler_env, seq, &reporter)? {
        Outcome::Completed => info!(event = "completed", operation = cmd.name, seq),
        Outcome::AlreadyProcessed => info!(event = "skipped", operation = cmd.name, seq),
    }
    Ok(())
}

fn resolve_dir(override_path: Option<&PathBuf>, var: &str, default: &str) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(var) {
        return PathBuf::from(path);
    }
    PathBuf::from(default)
}

fn resolve_handler_env(override_path: Option<&PathBuf>) -> Result<PathBuf, HandlerError> {
    if let Some(path) = override_path {
        return Ok(path.clone());
    }
    if let Ok(path) = env::var("SCRIPT_HANDLER_ENVIRONMENT") {
        return Ok(PathBuf::from(path));
    }
    // The host places the file in the extension root; the binary may sit in a subdirectory.
    if let Ok(exe) = env::current_exe() {
        for dir in exe.ancestors().skip(1).take(2) {
            let candidate = dir.join(HANDLER_ENV_FILE);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    Err(HandlerError::Config(format!(
        "cannot locate {HANDLER_ENV_FILE} next to the executable"
    )))
}

/// Status-bearing commands name their status file after the sequence number, so they need one.
fn resolve_seq_num(cmd: &Cmd, handler_env: &HandlerEnvironment) -> Result<u64, HandlerError> {
    let from_env = env::var(seqnum::SEQ_NUM_ENV).ok();
    match seqnum::find(from_env.as_deref(), &handler_env.folders.config_folder)? {
        Some(seq) => Ok(seq),
        None if cmd.should_report_status => Err(HandlerError::Config(format!(
            "cannot find sequence number: {} is unset and {} holds no settings",
            seqnum::SEQ_NUM_ENV,
            handler_env.folders.config_folder.display()
        ))),
        None => Ok(0),
    }
}
