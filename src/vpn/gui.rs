//! Tunnel driven through the `openvpn-gui` helper

use super::backend::{Method, TunnelBackend};
use super::profile::asset_files;
use crate::settings::get_home_dir;
use crate::utils::exec::local;
use crate::utils::process;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const STOP_GRACE: Duration = Duration::from_secs(10);
#[cfg(windows)]
const INTERACTIVE_SERVICE: &str = "OpenVPNServiceInteractive";

#[derive(Debug, Clone)]
pub struct GuiBackend {
    pub binary: PathBuf,
    pub profile_name: String,
    /// Folder the GUI reads profiles from (`~/OpenVPN/config`)
    pub config_dir: PathBuf,
}

impl GuiBackend {
    pub fn new(binary: PathBuf, profile_name: &str) -> Result<Self> {
        let config_dir = get_home_dir()?.join("OpenVPN").join("config");
        Ok(Self::with_config_dir(binary, profile_name, config_dir))
    }

    pub fn with_config_dir(binary: PathBuf, profile_name: &str, config_dir: PathBuf) -> Self {
        Self {
            binary,
            profile_name: profile_name.to_string(),
            config_dir,
        }
    }

    pub fn installed_profile(&self) -> PathBuf {
        self.config_dir.join(format!("{}.ovpn", self.profile_name))
    }

    /// Copy the clean profile and certificate assets into the GUI config folder
    pub fn install_profile(&self, clean_profile: &Path, assets_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(&self.config_dir)
            .with_context(|| format!("Failed to create {}", self.config_dir.display()))?;

        let destination = self.installed_profile();
        fs::copy(clean_profile, &destination).with_context(|| {
            format!(
                "Failed to copy {} to {}",
                clean_profile.display(),
                destination.display()
            )
        })?;
        tracing::debug!("Copied clean profile to {}", destination.display());

        for asset in asset_files(assets_dir)? {
            let Some(name) = asset.file_name() else {
                continue;
            };
            let target = self.config_dir.join(name);
            fs::copy(&asset, &target)
                .with_context(|| format!("Failed to copy {}", asset.display()))?;
            tracing::debug!("Copied asset {} to {}", asset.display(), target.display());
        }
        Ok(destination)
    }

    fn command(&self, args: &[&str]) {
        local::execute_unchecked(&self.binary.display().to_string(), args);
    }

    fn disconnect(&self) {
        self.command(&["--command", "disconnect", &self.profile_name]);
        tracing::info!("Disconnect command sent for profile {}", self.profile_name);
    }
}

impl TunnelBackend for GuiBackend {
    fn method(&self) -> Method {
        Method::Gui
    }

    fn prepare(&self, clean_profile: &Path, assets_dir: &Path) -> Result<()> {
        let destination = self.install_profile(clean_profile, assets_dir)?;
        tracing::info!("Prepared GUI profile at {}", destination.display());
        Ok(())
    }

    fn start(&self, _clean_profile: &Path, _assets_dir: &Path) -> Result<Option<u32>> {
        ensure_interactive_service()?;

        if self.pid().is_some() {
            tracing::info!("Profile {} already active, reconnecting", self.profile_name);
            self.disconnect();
            thread::sleep(Duration::from_secs(3));
        }

        let binary = self.binary.display().to_string();
        let launcher = local::spawn_detached(&binary, &["--connect", &self.profile_name])?;
        tracing::info!("Issued connect command via {} (pid {})", binary, launcher);

        thread::sleep(Duration::from_secs(2));
        Ok(self.pid())
    }

    fn stop(&self) -> Result<()> {
        self.disconnect();
        thread::sleep(Duration::from_secs(2));
        if let Some(pid) = self.pid() {
            tracing::debug!("Terminating lingering OpenVPN pid {}", pid);
            process::terminate(pid, STOP_GRACE)?;
        }
        Ok(())
    }

    fn stop_all(&self) -> Result<()> {
        self.command(&["--command", "disconnect_all"]);
        thread::sleep(Duration::from_secs(1));
        self.command(&["--command", "exit"]);

        let listing = process::list_openvpn_processes().unwrap_or_default();
        for pid in lingering_daemons(&listing) {
            if let Err(e) = process::terminate(pid, STOP_GRACE) {
                tracing::warn!("Could not stop OpenVPN pid {}: {}", pid, e);
            }
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        process::find_openvpn_process(&[self.profile_name.as_str()])
    }

    fn profile_available(&self) -> bool {
        self.installed_profile().is_file()
    }
}

/// OpenVPN daemon pids in a process listing, excluding the GUI itself
fn lingering_daemons(listing: &str) -> Vec<u32> {
    process::openvpn_daemons(listing)
        .into_iter()
        .map(|(pid, _)| pid)
        .collect()
}

/// Start the interactive service the GUI needs to bring adapters up
#[cfg(windows)]
fn ensure_interactive_service() -> Result<()> {
    let running = |output: &std::process::Output| {
        String::from_utf8_lossy(&output.stdout).contains("RUNNING")
    };
    let query = match local::execute("sc", &["query", INTERACTIVE_SERVICE]) {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!("Interactive service lookup failed: {}", e);
            return Ok(());
        }
    };
    if running(&query) {
        return Ok(());
    }

    tracing::info!("Starting {} service", INTERACTIVE_SERVICE);
    let started = local::execute("sc", &["start", INTERACTIVE_SERVICE])?;
    if !started.status.success() {
        anyhow::bail!(
            "Failed to start {}. Run prognoza with administrative privileges or start the service from Services.msc. Command output: {}",
            INTERACTIVE_SERVICE,
            local::output_text(&started)
        );
    }
    for _ in 0..10 {
        thread::sleep(Duration::from_secs(1));
        if local::execute("sc", &["query", INTERACTIVE_SERVICE]).is_ok_and(|o| running(&o)) {
            tracing::info!("{} service is running", INTERACTIVE_SERVICE);
            return Ok(());
        }
    }
    anyhow::bail!(
        "Timed out waiting for {} to report RUNNING. Verify the service is not disabled and that you have administrator rights.",
        INTERACTIVE_SERVICE
    )
}

#[cfg(not(windows))]
fn ensure_interactive_service() -> Result<()> {
    Ok(())
}
