use std::io::{self, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// The retained prefix of one output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Everything the process wrote, including what was dropped.
    pub total: usize,
}

impl Captured {
    pub fn is_truncated(&self) -> bool {
        self.total > self.bytes.len()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

/// Keep the first `max_bytes` and keep reading so the child never blocks on a
/// full pipe.
fn capture<R: Read + Send + 'static>(stream: R, max_bytes: usize) -> thread::JoinHandle<Captured> {
    thread::spawn(move || {
        let mut captured = Captured::default();
        let mut reader = BufReader::new(stream);
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let room = max_bytes.saturating_sub(captured.bytes.len());
                    captured.bytes.extend_from_slice(&buf[..n.min(room)]);
                    captured.total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        captured
    })
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    // The child leads its own process group, so this reaches grandchildren too.
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: killpg only sends a signal; a stale pgid yields ESRCH.
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

/// Run `command` with null stdin, captured output, and a hard deadline.
///
/// On Unix the child is placed in a new process group. The whole group is
/// killed once the child exits or the deadline passes, so nothing it started
/// keeps running after this returns.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
    max_bytes: usize,
) -> io::Result<CommandRunResult> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command.spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("failed to capture stderr"))?;

    let stdout_handle = capture(stdout, max_bytes);
    let stderr_handle = capture(stderr, max_bytes);

    let (status, timed_out) = match child.wait_timeout(timeout)? {
        Some(status) => {
            // Background jobs outlive `sh` and hold the pipes open. Output they
            // already wrote stays readable after the kill.
            kill_tree(&mut child);
            (Some(status), false)
        }
        None => {
            kill_tree(&mut child);
            (child.wait().ok(), true)
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    Ok(CommandRunResult {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let result = run_command_with_timeout(&mut cmd, Duration::from_secs(10), 1024).unwrap();
        assert_eq!(result.stdout.text(), "out\n");
        assert_eq!(result.stderr.text(), "err\n");
        assert_eq!(result.status.and_then(|s| s.code()), Some(3));
        assert!(!result.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_caps_but_drains() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "head -c 200000 /dev/zero"]);
        let result = run_command_with_timeout(&mut cmd, Duration::from_secs(10), 1000).unwrap();
        assert_eq!(result.stdout.bytes.len(), 1000);
        assert_eq!(result.stdout.total, 200_000);
        assert!(result.stdout.is_truncated());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_kills_group_on_timeout() {
        let mut cmd = Command::new("sh");
        // The background sleep holds the pipes open; it must die with the group.
        cmd.args(["-c", "sleep 30 & echo started; sleep 30"]);
        let start = Instant::now();
        let result = run_command_with_timeout(&mut cmd, Duration::from_millis(300), 1024).unwrap();
        assert!(result.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(result.stdout.text(), "started\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_reaps_background_jobs_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late.txt");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!(
            "(sleep 2; touch '{}') & echo started",
            marker.display()
        ));
        let start = Instant::now();
        let result = run_command_with_timeout(&mut cmd, Duration::from_secs(10), 1024).unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!result.timed_out);
        assert_eq!(result.status.and_then(|s| s.code()), Some(0));
        assert_eq!(result.stdout.text(), "started\n");

        std::thread::sleep(Duration::from_secs(3));
        assert!(!marker.exists(), "background job kept running");
    }
}
