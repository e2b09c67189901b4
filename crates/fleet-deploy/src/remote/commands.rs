//! Shell snippets run on fleet hosts. The text here must stay stable: restore
//! and sync depend on files written by earlier runs.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::remote_text::{last_nonblank_line, sanitize_for_log};

pub const REMOTE_LOG_DIR: &str = "/home/ubuntu/ydyl-deploy-logs";
pub const WORKLOAD_DIR: &str = "/home/ubuntu/workspace/ydyl-deployment-suite";

/// Detach `cmd` under `nohup`, schedule host shutdown after `run_mins`, and
/// print the background pid.
pub fn background_command(cmd: &str, log_file: &str, log_dir: &str, run_mins: u64) -> String {
    format!(
        "sudo -n shutdown -h +{run_mins}; mkdir -p {log_dir}; cd {WORKLOAD_DIR}; \
         nohup {cmd} > {log_file} 2>&1 & echo $!"
    )
}

/// Remote `(log file, log dir)`: reuse a recorded path, else `<REMOTE_LOG_DIR>/<name>.log`.
pub fn remote_log_path(existing: &str, name: &str) -> (String, String) {
    let existing = existing.trim();
    if !existing.is_empty() {
        let dir = match existing.rsplit_once('/') {
            Some(("", _)) => "/".to_string(),
            Some((dir, _)) => dir.to_string(),
            None => ".".to_string(),
        };
        return (existing.to_string(), dir);
    }
    (
        format!("{REMOTE_LOG_DIR}/{name}.log"),
        REMOTE_LOG_DIR.to_string(),
    )
}

pub fn local_log_path(log_dir: &Path, address: &str, name: &str) -> PathBuf {
    log_dir.join(format!(
        "{}-{}.log",
        file_component(address),
        file_component(name)
    ))
}

fn file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect()
}

pub fn log_size_command(path: &str) -> String {
    format!("wc -c < {path} 2>/dev/null || echo 0")
}

/// Bytes from `offset` (0-based) to the end; `tail -c +N` is 1-based.
pub fn tail_command(path: &str, offset: u64) -> String {
    format!("tail -c +{} {path} 2>/dev/null || true", offset + 1)
}

pub fn liveness_command(pid: u32) -> String {
    format!("ps -p {pid} -o pid=")
}

/// The last non-blank line of the launch output must be the background pid.
pub fn parse_remote_pid(stdout: &str) -> Result<u32> {
    let line = last_nonblank_line(stdout).ok_or_else(|| {
        Error::msg("parse remote pid: empty output")
    })?;
    match line.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(Error::msg(format!(
            "parse remote pid: unexpected output '{}'",
            sanitize_for_log(line)
        ))),
    }
}

pub fn parse_log_size(stdout: &str) -> Result<u64> {
    let line = last_nonblank_line(stdout).unwrap_or("0");
    line.parse::<u64>().map_err(|_| {
        Error::msg(format!(
            "parse remote log size: unexpected output '{}'",
            sanitize_for_log(line)
        ))
    })
}
