//! Lifecycle commands the host invokes and the dispatcher that sequences them.
//!
//! `enable` is guarded by the persisted sequence number: its pre-check migrates
//! legacy state, then skips configurations that were already started. The
//! sequence number is saved before the action runs, so a crash mid-action
//! leaves that configuration marked as processed and it will not be retried.

use crate::download::{download_files, Fetcher};
use crate::error::HandlerError;
use crate::exec::run_command;
use crate::migrate::migrate_data_dir;
use crate::seqnum;
use crate::settings::{self, HandlerEnvironment};
use crate::status::{StatusReporter, StatusType};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub const DATA_DIR: &str = "/var/lib/waagent/custom-script";
pub const LEGACY_DATA_DIR: &str = "/var/lib/azure/custom-script";
pub const SEQ_NUM_FILE: &str = "seqnum";
pub const DOWNLOAD_DIR: &str = "download";

/// Where persisted state lives.
#[derive(Debug, Clone)]
pub struct Layout {
    pub data_dir: PathBuf,
    pub legacy_data_dir: PathBuf,
}

impl Layout {
    pub fn seqnum_path(&self) -> PathBuf {
        self.data_dir.join(SEQ_NUM_FILE)
    }

    pub fn download_dir(&self, seq: u64) -> PathBuf {
        self.data_dir.join(DOWNLOAD_DIR).join(seq.to_string())
    }
}

pub struct HandlerContext<'a> {
    pub layout: Layout,
    pub cert_dir: PathBuf,
    pub fetcher: &'a dyn Fetcher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreCheck {
    Proceed,
    AlreadyProcessed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    AlreadyProcessed,
}

pub type ActionFn =
    fn(&HandlerContext<'_>, &HandlerEnvironment, u64) -> Result<(), HandlerError>;
pub type PreCheckFn = fn(&HandlerContext<'_>, u64) -> Result<PreCheck, HandlerError>;

#[derive(Clone, Copy)]
pub struct Cmd {
    pub name: &'static str,
    pub action: ActionFn,
    /// Whether progress goes to the host's status file.
    pub should_report_status: bool,
    /// Runs before any status is reported.
    pub pre: Option<PreCheckFn>,
}

pub struct CommandTable {
    commands: BTreeMap<&'static str, Cmd>,
}

impl CommandTable {
    pub fn standard() -> Self {
        let mut commands = BTreeMap::new();
        let mut add = |key: &'static str, cmd: Cmd| {
            commands.insert(key, cmd);
        };
        add(
            "install",
            Cmd {
                name: "Install",
                action: install,
                should_report_status: false,
                pre: None,
            },
        );
        add(
            "uninstall",
            Cmd {
                name: "Uninstall",
                action: uninstall,
                should_report_status: false,
                pre: None,
            },
        );
        add(
            "enable",
            Cmd {
                name: "Enable",
                action: enable,
                should_report_status: true,
                pre: Some(enable_pre),
            },
        );
        add(
            "update",
            Cmd {
                name: "Update",
                action: noop,
                should_report_status: true,
                pre: None,
            },
        );
        add(
            "disable",
            Cmd {
                name: "Disable",
                action: noop,
                should_report_status: true,
                pre: None,
            },
        );
        Self { commands }
    }

    pub fn get(&self, key: &str) -> Result<&Cmd, HandlerError> {
        self.commands.get(key).ok_or_else(|| {
            let known: Vec<&str> = self.keys().copied().collect();
            HandlerError::UnknownCommand(format!("{key} (expected one of {})", known.join(", ")))
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &&'static str> {
        self.commands.keys()
    }
}

/// Runs one command: pre-check, then the action bracketed by status reports.
pub fn dispatch(
    cmd: &Cmd,
    ctx: &HandlerContext<'_>,
    env: &HandlerEnvironment,
    seq: u64,
    reporter: &dyn StatusReporter,
) -> Result<Outcome, HandlerError> {
    info!(event = "start", operation = cmd.name, seq);
    if let Some(pre) = cmd.pre {
        if pre(ctx, seq)? == PreCheck::AlreadyProcessed {
            info!(
                event = "exit",
                seq,
                message = "this script configuration is already processed, will not run again"
            );
            return Ok(Outcome::AlreadyProcessed);
        }
    }

    if cmd.should_report_status {
        report_status(
            reporter,
            seq,
            cmd.name,
            StatusType::Transitioning,
            &format!("{} in progress", cmd.name),
        );
    }

    match (cmd.action)(ctx, env, seq) {
        Ok(()) => {
            if cmd.should_report_status {
                report_status(
                    reporter,
                    seq,
                    cmd.name,
                    StatusType::Success,
                    &format!("{} succeeded", cmd.name),
                );
            }
            info!(event = "end", operation = cmd.name, seq);
            Ok(Outcome::Completed)
        }
        Err(err) => {
            error!(event = "failed", operation = cmd.name, seq, error = %err);
            if cmd.should_report_status {
                let message = format!("{} failed: {err}", cmd.name);
                report_status(reporter, seq, cmd.name, StatusType::Error, &message);
            }
            Err(err)
        }
    }
}

/// Status is advisory: a failed write never decides the command's outcome.
fn report_status(
    reporter: &dyn StatusReporter,
    seq: u64,
    operation: &str,
    status: StatusType,
    message: &str,
) {
    if let Err(err) = reporter.report(seq, operation, status, message) {
        error!(event = "failed to report status", operation, seq, status = ?status, error = %err);
    }
}

fn noop(_ctx: &HandlerContext<'_>, _env: &HandlerEnvironment, _seq: u64) -> Result<(), HandlerError> {
    info!(event = "noop");
    Ok(())
}

fn create_data_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)
    }
}

fn install(ctx: &HandlerContext<'_>, _env: &HandlerEnvironment, _seq: u64) -> Result<(), HandlerError> {
    let data_dir = &ctx.layout.data_dir;
    create_data_dir(data_dir)
        .map_err(|err| HandlerError::state_dir("failed to create data dir", err))?;
    info!(event = "created data dir", path = %data_dir.display());
    info!(event = "installed");
    Ok(())
}

fn uninstall(ctx: &HandlerContext<'_>, _env: &HandlerEnvironment, _seq: u64) -> Result<(), HandlerError> {
    let data_dir = &ctx.layout.data_dir;
    info!(event = "removing data dir", path = %data_dir.display());
    match fs::remove_dir_all(data_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(HandlerError::state_dir("failed to delete data dir", err)),
    }
    info!(event = "removed data dir", path = %data_dir.display());
    info!(event = "uninstalled");
    Ok(())
}

fn enable_pre(ctx: &HandlerContext<'_>, seq: u64) -> Result<PreCheck, HandlerError> {
    // The sequence file may still sit under the legacy root, so migrate first.
    info!(message = "checking for state migration");
    migrate_data_dir(&ctx.layout.legacy_data_dir, &ctx.layout.data_dir)?;

    check_and_save_seq_num(seq, &ctx.layout.seqnum_path())
        .map_err(|err| err.context("failed to process seqnum"))
}

/// Saves `seq` unless it is not newer than the stored one.
pub fn check_and_save_seq_num(seq: u64, path: &Path) -> Result<PreCheck, HandlerError> {
    info!(event = "comparing seqnum", path = %path.display());
    if !seqnum::is_newer(path, seq)? {
        return Ok(PreCheck::AlreadyProcessed);
    }
    seqnum::persist(path, seq)?;
    info!(event = "seqnum saved", path = %path.display(), seq);
    Ok(PreCheck::Proceed)
}

fn enable(ctx: &HandlerContext<'_>, env: &HandlerEnvironment, seq: u64) -> Result<(), HandlerError> {
    let cfg = settings::parse_and_validate(&env.folders.config_folder, seq, &ctx.cert_dir)
        .map_err(|err| err.context("failed to get configuration"))?;

    let dir = ctx.layout.download_dir(seq);
    download_files(ctx.fetcher, &dir, &cfg.download_targets())
        .map_err(|err| err.context("processing file downloads failed"))?;

    run_command(cfg.command(), &dir).map_err(|err| err.context("failed to execute command"))?;

    info!(event = "enabled");
    Ok(())
}
