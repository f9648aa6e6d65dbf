use crate::error::HandlerError;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{error, info};

const SHELL: &str = "/bin/sh";
const OUTPUT_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(OUTPUT_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

/// Runs `command` through the shell inside `dir`, blocking until it exits.
///
/// Output is captured and mirrored to `stdout`/`stderr` files in `dir`.
pub fn run_command(command: &str, dir: &Path) -> Result<CommandOutput, HandlerError> {
    if command.trim().is_empty() {
        return Err(HandlerError::Config(
            "refusing to execute an empty command".to_string(),
        ));
    }
    info!(event = "executing command", output = %dir.display());
    let output = Command::new(SHELL)
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .output()
        .map_err(|err| HandlerError::Process(format!("failed to launch command: {err}")))?;
    let result = CommandOutput {
        status_code: output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 }),
        stdout: output.stdout,
        stderr: output.stderr,
    };
    for (name, bytes) in [("stdout", &result.stdout), ("stderr", &result.stderr)] {
        let path = dir.join(name);
        fs::write(&path, bytes).map_err(|err| {
            HandlerError::state_dir(format!("failed to write {}", path.display()), err)
        })?;
    }

    if !result.success() {
        let mut message = format!("command exited with status {}", result.status_code);
        let stdout = tail(&result.stdout);
        let stderr = tail(&result.stderr);
        if !stdout.is_empty() {
            message = format!("{message}\n[stdout]\n{stdout}");
        }
        if !stderr.is_empty() {
            message = format!("{message}\n[stderr]\n{stderr}");
        }
        error!(event = "failed to execute command", status = result.status_code, output = %dir.display());
        return Err(HandlerError::Process(message));
    }
    info!(event = "executed command", output = %dir.display());
    Ok(result)
}
