//! Tunnel driven by the `openvpn` daemon

use super::backend::{Method, TunnelBackend};
use crate::utils::exec::local;
use crate::utils::process;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CliBackend {
    pub binary: PathBuf,
    pub profile_name: String,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
}

impl CliBackend {
    pub fn new(binary: PathBuf, profile_name: &str, log_file: PathBuf, pid_file: PathBuf) -> Self {
        Self {
            binary,
            profile_name: profile_name.to_string(),
            log_file,
            pid_file,
        }
    }

    /// Arguments passed to `openvpn`
    pub fn launch_args(&self, clean_profile: &Path, assets_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            clean_profile.display().to_string(),
            "--cd".to_string(),
            assets_dir.display().to_string(),
            "--log".to_string(),
            self.log_file.display().to_string(),
            "--writepid".to_string(),
            self.pid_file.display().to_string(),
            "--verb".to_string(),
            "3".to_string(),
        ];
        if cfg!(unix) {
            args.push("--daemon".to_string());
        }
        args
    }

    fn live_pid(&self) -> Option<u32> {
        process::read_pid_file(&self.pid_file).filter(|pid| process::is_process_alive(*pid))
    }
}

impl TunnelBackend for CliBackend {
    fn method(&self) -> Method {
        Method::Cli
    }

    fn prepare(&self, _clean_profile: &Path, _assets_dir: &Path) -> Result<()> {
        if let Some(parent) = self.log_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(())
    }

    fn start(&self, clean_profile: &Path, assets_dir: &Path) -> Result<Option<u32>> {
        if let Some(pid) = self.live_pid() {
            tracing::info!("OpenVPN already running for {} (pid {}), restarting", self.profile_name, pid);
            self.stop()?;
        }

        let args = self.launch_args(clean_profile, assets_dir);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let binary = self.binary.display().to_string();
        tracing::info!("Starting {} {}", binary, args.join(" "));

        if cfg!(unix) {
            // --daemon forks, the pid file carries the real PID
            let output = local::execute(&binary, &arg_refs)?;
            if !output.status.success() {
                anyhow::bail!(
                    "openvpn exited with {}: {}",
                    output.status,
                    local::output_text(&output)
                );
            }
            std::thread::sleep(Duration::from_millis(500));
            Ok(process::read_pid_file(&self.pid_file))
        } else {
            let pid = local::spawn_detached(&binary, &arg_refs)?;
            process::write_pid_file(&self.pid_file, pid)?;
            Ok(Some(pid))
        }
    }

    fn stop(&self) -> Result<()> {
        let pid = self
            .live_pid()
            .or_else(|| process::find_openvpn_process(&[self.profile_name.as_str()]));
        match pid {
            Some(pid) => {
                tracing::info!("Stopping OpenVPN pid {}", pid);
                process::terminate(pid, STOP_GRACE)?;
            }
            None => tracing::debug!("No OpenVPN process for {}", self.profile_name),
        }
        process::remove_pid_file(&self.pid_file);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.live_pid()
            .or_else(|| process::find_openvpn_process(&[self.profile_name.as_str()]))
    }
}
