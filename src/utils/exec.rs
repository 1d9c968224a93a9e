use anyhow::{Context, Result};
use std::process::{Command, Output, Stdio};

/// Local command execution helpers
pub mod local {
    use super::*;

    pub fn execute(program: &str, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());
        hide_window(&mut cmd);
        cmd.output()
            .with_context(|| format!("Failed to execute command: {}", program))
    }

    /// Run a command and ignore its exit status, logging failures at debug level
    pub fn execute_unchecked(program: &str, args: &[&str]) {
        match execute(program, args) {
            Ok(output) if !output.status.success() => {
                tracing::debug!(
                    "{} {:?} exited with {}: {}",
                    program,
                    args,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("{}", e),
        }
    }

    /// Spawn a long-running process without waiting for it, returning its PID
    pub fn spawn_detached(program: &str, args: &[&str]) -> Result<u32> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.stdin(Stdio::null());
        hide_window(&mut cmd);
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", program))?;
        Ok(child.id())
    }

    /// Combined stdout/stderr text of a finished command
    pub fn output_text(output: &Output) -> String {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        format!("{}{}", stdout, stderr).trim().to_string()
    }

    #[cfg(windows)]
    fn hide_window(cmd: &mut Command) {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    #[cfg(not(windows))]
    fn hide_window(_cmd: &mut Command) {}
}
