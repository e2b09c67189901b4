use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::executor::CancelToken;

const POLL_EVERY: Duration = Duration::from_millis(50);

/// Captured result of a local subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Short human-readable summary: stderr, else stdout, else the status.
    pub fn summary(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_string();
        if !stderr.is_empty() {
            return stderr;
        }
        let stdout = String::from_utf8_lossy(&self.stdout).trim().to_string();
        if !stdout.is_empty() {
            return stdout;
        }
        match self.code {
            Some(c) => format!("exit status {c}"),
            None => "terminated by signal".into(),
        }
    }
}

/// Run `cmd` to completion, killing its process group on timeout or cancel.
pub fn run_captured(
    mut cmd: Command,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<ProcessOutput> {
    cancel.check()?;

    // Own process group so the whole subtree (ssh + ControlMaster helpers) dies with it.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to spawn {program}: {e}")))?;

    let out_reader = child.stdout.take().map(spawn_reader);
    let err_reader = child.stderr.take().map(spawn_reader);

    let deadline = timeout.map(|t| Instant::now() + t);
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::msg(format!("wait for {program} failed: {e}")))?
        {
            break status;
        }
        if cancel.is_cancelled() {
            terminate(&mut child);
            join_reader(out_reader);
            join_reader(err_reader);
            return Err(Error::cancelled());
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            terminate(&mut child);
            join_reader(out_reader);
            join_reader(err_reader);
            return Err(Error::msg(format!(
                "{program} timed out after {}s",
                timeout.unwrap_or_default().as_secs()
            )));
        }
        std::thread::sleep(POLL_EVERY);
    };

    Ok(ProcessOutput {
        stdout: join_reader(out_reader),
        stderr: join_reader(err_reader),
        code: status.code(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn terminate(child: &mut Child) {
    kill_pgroup(child.id(), false);
    std::thread::sleep(POLL_EVERY);
    kill_pgroup(child.id(), true);
    let _ = child.kill();
    let _ = child.wait();
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative pid addresses the whole group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_streams_and_exit_code() {
        let out = run_captured(
            sh("echo out; echo err >&2; exit 3"),
            None,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(out.stdout_text(), "out\n");
        assert_eq!(String::from_utf8_lossy(&out.stderr), "err\n");
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.summary(), "err");
    }

    #[test]
    fn timeout_kills_the_child() {
        let start = Instant::now();
        let err = run_captured(
            sh("sleep 30"),
            Some(Duration::from_millis(200)),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancel_before_start_never_spawns() {
        let token = CancelToken::new();
        token.cancel();
        let err = run_captured(sh("exit 0"), None, &token).unwrap_err();
        assert!(err.is_cancelled());
    }
}
