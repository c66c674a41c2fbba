//! bash: one `sh -c` per call, rooted at the workspace.

use super::{ToolError, ToolOutput};
use crate::sandbox::Workspace;
use crate::util::{run_command_with_timeout, Captured};
use std::process::Command;
use std::time::Duration;

/// Variables passed through from the agent's own environment.
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TMPDIR"];

#[derive(Debug)]
pub struct ShellOutcome {
    pub exit_code: Option<i32>,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl ShellOutcome {
    /// stdout, then stderr under a separator, with a marker on capped streams.
    pub fn render(&self) -> String {
        let mut result = String::new();
        append_stream(&mut result, &self.stdout);
        if !self.stderr.bytes.is_empty() {
            if !result.is_empty() {
                result.push_str("\n--- stderr ---\n");
            }
            append_stream(&mut result, &self.stderr);
        }
        result
    }
}

fn append_stream(out: &mut String, stream: &Captured) {
    out.push_str(&stream.text());
    if stream.is_truncated() {
        out.push_str(&format!(
            "\n[... {} more bytes not captured]",
            stream.total - stream.bytes.len()
        ));
    }
}

/// Run `command` under `sh -c` in the workspace root with a scrubbed environment.
pub fn run_shell(
    workspace: &Workspace,
    command: &str,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<ShellOutcome, ToolError> {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command])
        .current_dir(workspace.root())
        .env_clear();
    for key in INHERITED_ENV {
        if let Some(value) = std::env::var_os(key) {
            cmd.env(key, value);
        }
    }
    cmd.env("TERM", "dumb")
        .env("PAGER", "cat")
        .env("GIT_PAGER", "cat");

    let result =
        run_command_with_timeout(&mut cmd, timeout, max_output_bytes).map_err(ToolError::Spawn)?;

    Ok(ShellOutcome {
        exit_code: result.status.and_then(|s| s.code()),
        stdout: result.stdout,
        stderr: result.stderr,
        timed_out: result.timed_out,
    })
}

pub(super) fn execute_bash(
    workspace: &Workspace,
    command: &str,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<ToolOutput, ToolError> {
    let outcome = run_shell(workspace, command, timeout, max_output_bytes)?;
    let rendered = outcome.render();

    if outcome.timed_out {
        let partial = if rendered.is_empty() {
            String::new()
        } else {
            format!("\nPartial output:\n{rendered}")
        };
        return Err(ToolError::SubprocessTimeout {
            secs: timeout.as_secs(),
            partial,
        });
    }

    let truncated = outcome.stdout.is_truncated() || outcome.stderr.is_truncated();
    // Killed by a signal reports no code.
    let exit_code = outcome.exit_code.unwrap_or(-1);

    let content = if rendered.is_empty() {
        format!("Command completed with exit code {exit_code}")
    } else if exit_code != 0 {
        format!("{rendered}\n[exit code: {exit_code}]")
    } else {
        rendered
    };

    Ok(ToolOutput { content, truncated })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        (dir, ws)
    }

    #[test]
    fn test_shell_echo() {
        let (_dir, ws) = workspace();
        let output = execute_bash(&ws, "echo hello world", Duration::from_secs(10), 1024).unwrap();
        assert_eq!(output.content, "hello world\n");
        assert!(!output.truncated);
    }

    #[test]
    fn test_shell_runs_in_workspace_root() {
        let (_dir, ws) = workspace();
        fs::write(ws.root().join("test.rs"), "fn hello_world() {}\n").unwrap();
        let output =
            execute_bash(&ws, "grep -n hello_world test.rs", Duration::from_secs(10), 1024)
                .unwrap();
        assert!(output.content.contains("1:fn hello_world"));
    }

    #[test]
    fn test_shell_reports_exit_code_and_stderr() {
        let (_dir, ws) = workspace();
        let output = execute_bash(
            &ws,
            "echo out; echo oops >&2; exit 2",
            Duration::from_secs(10),
            1024,
        )
        .unwrap();
        assert_eq!(output.content, "out\n\n--- stderr ---\noops\n\n[exit code: 2]");

        let output = execute_bash(&ws, "true", Duration::from_secs(10), 1024).unwrap();
        assert_eq!(output.content, "Command completed with exit code 0");
    }

    #[test]
    fn test_shell_environment_is_scrubbed() {
        let (_dir, ws) = workspace();
        std::env::set_var("CRAFT_CODE_TEST_SECRET", "hunter2");
        let output = execute_bash(
            &ws,
            "echo \"[$CRAFT_CODE_TEST_SECRET] $TERM\"",
            Duration::from_secs(10),
            1024,
        )
        .unwrap();
        assert_eq!(output.content, "[] dumb\n");
    }

    #[test]
    fn test_shell_output_is_capped() {
        let (_dir, ws) = workspace();
        let output =
            execute_bash(&ws, "yes x | head -n 5000", Duration::from_secs(10), 100).unwrap();
        assert!(output.truncated);
        assert!(output.content.contains("more bytes not captured"));
    }

    #[test]
    fn test_shell_timeout_kills_and_reports() {
        let (_dir, ws) = workspace();
        let err = execute_bash(
            &ws,
            "echo before; sleep 30",
            Duration::from_millis(300),
            1024,
        )
        .unwrap_err();
        match err {
            ToolError::SubprocessTimeout { partial, .. } => assert!(partial.contains("before")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_shell_background_job_does_not_hold_the_call() {
        let (_dir, ws) = workspace();
        let start = std::time::Instant::now();
        let output =
            execute_bash(&ws, "sleep 8 & echo started", Duration::from_secs(1), 1024).unwrap();
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(output.content, "started\n");
    }
}
