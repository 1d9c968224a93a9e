//! Process lookup and termination helpers

use crate::utils::exec::local;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// A pid that names exactly one process. Zero and values past `i32::MAX`
/// address process groups or every process when handed to `kill`.
pub fn valid_pid(pid: u32) -> bool {
    pid > 0 && i32::try_from(pid).is_ok()
}

#[cfg(unix)]
fn unix_pid(pid: u32) -> Result<nix::unistd::Pid> {
    if !valid_pid(pid) {
        anyhow::bail!("Refusing to signal invalid pid {}", pid);
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

/// Check if a process is running by PID
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    match unix_pid(pid) {
        Ok(target) => nix::sys::signal::kill(target, None).is_ok(),
        Err(_) => false,
    }
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    if !valid_pid(pid) {
        return false;
    }
    let filter = format!("PID eq {}", pid);
    match local::execute("tasklist", &["/FI", &filter, "/NH", "/FO", "CSV"]) {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&format!("\"{}\"", pid)),
        Err(_) => false,
    }
}

/// Ask a process to exit, escalating to a hard kill after `grace`
pub fn terminate(pid: u32, grace: Duration) -> Result<()> {
    if !valid_pid(pid) {
        anyhow::bail!("Refusing to terminate invalid pid {}", pid);
    }
    request_exit(pid)?;

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            tracing::debug!("Process {} exited", pid);
            return Ok(());
        }
        thread::sleep(Duration::from_millis(200));
    }

    tracing::warn!("Process {} ignored termination request, killing", pid);
    force_kill(pid)
}

#[cfg(unix)]
fn request_exit(pid: u32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    match kill(unix_pid(pid)?, Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to send SIGTERM to {}", pid)),
    }
}

#[cfg(unix)]
fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    match kill(unix_pid(pid)?, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to send SIGKILL to {}", pid)),
    }
}

#[cfg(windows)]
fn request_exit(pid: u32) -> Result<()> {
    local::execute_unchecked("taskkill", &["/PID", &pid.to_string()]);
    Ok(())
}

#[cfg(windows)]
fn force_kill(pid: u32) -> Result<()> {
    let output = local::execute("taskkill", &["/F", "/PID", &pid.to_string()])?;
    if !output.status.success() && is_process_alive(pid) {
        anyhow::bail!("Failed to kill {}: {}", pid, local::output_text(&output));
    }
    Ok(())
}

/// True for an OpenVPN daemon executable (`openvpn`, `/usr/sbin/openvpn`,
/// `openvpn.exe`), false for the GUI helper and anything else
pub fn is_openvpn_daemon(executable: &str) -> bool {
    let name = executable
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(executable)
        .to_lowercase();
    name.starts_with("openvpn") && !name.starts_with("openvpn-gui")
}

/// OpenVPN daemons in a `<pid> <executable> <arguments>` listing, with
/// their lower-cased arguments. The executable name decides the match so
/// editors or pagers opened on OpenVPN files are never picked up.
pub fn openvpn_daemons(listing: &str) -> Vec<(u32, String)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().splitn(3, char::is_whitespace);
            let pid: u32 = fields.next()?.parse().ok()?;
            let executable = fields.next()?;
            let args = fields.next().unwrap_or("").to_lowercase();
            (valid_pid(pid) && is_openvpn_daemon(executable)).then_some((pid, args))
        })
        .collect()
}

/// First OpenVPN daemon in the listing whose arguments contain every token
/// (case-insensitive)
pub fn find_in_listing(listing: &str, tokens: &[&str]) -> Option<u32> {
    let tokens: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
    openvpn_daemons(listing)
        .into_iter()
        .find(|(_, args)| tokens.iter().all(|t| args.contains(t.as_str())))
        .map(|(pid, _)| pid)
}

/// `<pid> <executable> <arguments>` for every process mentioning OpenVPN on the host
pub fn list_openvpn_processes() -> Result<String> {
    #[cfg(unix)]
    let output = local::execute("pgrep", &["-af", "openvpn"])?;
    #[cfg(windows)]
    let output = local::execute(
        "powershell",
        &[
            "-NoProfile",
            "-Command",
            "Get-CimInstance Win32_Process -Filter \"Name like '%openvpn%'\" | ForEach-Object { \"$($_.ProcessId) $($_.Name) $($_.CommandLine)\" }",
        ],
    )?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// PID of an OpenVPN daemon whose arguments mention every token
pub fn find_openvpn_process(tokens: &[&str]) -> Option<u32> {
    match list_openvpn_processes() {
        Ok(listing) => find_in_listing(&listing, tokens),
        Err(e) => {
            tracing::debug!("Process listing failed: {}", e);
            None
        }
    }
}

/// PID stored in `path`, ignoring values that do not name a single process
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let pid: u32 = fs::read_to_string(path).ok()?.trim().parse().ok()?;
    if !valid_pid(pid) {
        tracing::warn!("Ignoring invalid pid {} in {}", pid, path.display());
        return None;
    }
    Some(pid)
}

pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    fs::write(path, format!("{}\n", pid))
        .with_context(|| format!("Failed to write pid file: {}", path.display()))
}

pub fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}
