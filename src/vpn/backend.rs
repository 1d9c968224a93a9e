//! OpenVPN front-end detection and the backend seam

use crate::settings::{MethodPreference, VpnSettings};
use crate::utils::process;
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};

const PROGRAM_ROOT_VARS: [&str; 3] = ["ProgramFiles", "ProgramW6432", "ProgramFiles(x86)"];

#[cfg(windows)]
const CLI_BINARY: &str = "openvpn.exe";
#[cfg(not(windows))]
const CLI_BINARY: &str = "openvpn";
const GUI_BINARY: &str = "openvpn-gui.exe";

/// OpenVPN front end driving the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Cli,
    Gui,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Cli => "cli",
            Method::Gui => "gui",
        }
    }
}

/// Installed OpenVPN binaries and the method chosen between them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub method: Method,
    pub cli_path: Option<PathBuf>,
    pub gui_path: Option<PathBuf>,
}

/// Start, stop and inspect a tunnel for one profile
pub trait TunnelBackend: Send + Sync {
    fn method(&self) -> Method;

    /// Make the clean profile and its assets visible to the front end
    fn prepare(&self, clean_profile: &Path, assets_dir: &Path) -> Result<()>;

    fn start(&self, clean_profile: &Path, assets_dir: &Path) -> Result<Option<u32>>;

    fn stop(&self) -> Result<()>;

    /// Tear down every session this front end owns
    fn stop_all(&self) -> Result<()> {
        self.stop()
    }

    /// PID of the OpenVPN process serving the profile
    fn pid(&self) -> Option<u32>;

    /// Whether the front end can see the profile without `prepare`
    fn profile_available(&self) -> bool {
        true
    }
}

/// Stand-in when no usable OpenVPN front end was found. It still sees a
/// tunnel started outside prognoza but refuses to start one.
pub struct UnavailableBackend {
    pub profile_name: String,
    pub reason: String,
}

impl TunnelBackend for UnavailableBackend {
    fn method(&self) -> Method {
        Method::Cli
    }

    fn prepare(&self, _clean_profile: &Path, _assets_dir: &Path) -> Result<()> {
        anyhow::bail!("{}", self.reason)
    }

    fn start(&self, _clean_profile: &Path, _assets_dir: &Path) -> Result<Option<u32>> {
        anyhow::bail!("{}", self.reason)
    }

    fn stop(&self) -> Result<()> {
        match self.pid() {
            Some(pid) => process::terminate(pid, std::time::Duration::from_secs(10)),
            None => Ok(()),
        }
    }

    fn pid(&self) -> Option<u32> {
        process::find_openvpn_process(&[self.profile_name.as_str()])
    }
}

/// Where binaries are searched for; injectable so detection can be tested
pub struct Locator {
    pub program_roots: Vec<PathBuf>,
    pub on_path: fn(&str) -> Option<PathBuf>,
}

fn which_on_path(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

impl Locator {
    pub fn system() -> Locator {
        Locator {
            program_roots: PROGRAM_ROOT_VARS
                .iter()
                .filter_map(|var| std::env::var_os(var).map(PathBuf::from))
                .collect(),
            on_path: which_on_path,
        }
    }

    fn find(&self, explicit: Option<&Path>, binary: &str) -> Option<PathBuf> {
        if let Some(path) = explicit {
            if path.is_file() {
                return Some(path.to_path_buf());
            }
            tracing::warn!("Configured OpenVPN binary not found: {}", path.display());
        }
        self.program_roots
            .iter()
            .map(|root| root.join("OpenVPN").join("bin").join(binary))
            .find(|candidate| candidate.is_file())
            .or_else(|| (self.on_path)(binary))
            .or_else(|| {
                let bare = binary.strip_suffix(".exe")?;
                (self.on_path)(bare)
            })
    }
}

fn choose_method(preference: MethodPreference, has_cli: bool, has_gui: bool) -> Option<Method> {
    match (preference, has_cli, has_gui) {
        (_, false, false) => None,
        (MethodPreference::Gui, _, true) => Some(Method::Gui),
        (MethodPreference::Cli, false, true) => {
            tracing::warn!("OpenVPN CLI requested but not installed, using the GUI helper");
            Some(Method::Gui)
        }
        (MethodPreference::Gui, true, false) => {
            tracing::warn!("OpenVPN GUI requested but not installed, using the CLI");
            Some(Method::Cli)
        }
        (_, true, _) => Some(Method::Cli),
        (MethodPreference::Auto, false, true) => Some(Method::Gui),
    }
}

pub fn find_openvpn_with(settings: &VpnSettings, locator: &Locator) -> Result<Detection> {
    let cli_path = locator.find(settings.cli_path.as_deref(), CLI_BINARY);
    let gui_path = locator.find(settings.gui_path.as_deref(), GUI_BINARY);

    let Some(method) = choose_method(settings.method, cli_path.is_some(), gui_path.is_some()) else {
        anyhow::bail!(
            "OpenVPN not found. Install OpenVPN Community Edition (https://openvpn.net/community-downloads/) \
             so that openvpn or openvpn-gui.exe exists under <Program Files>/OpenVPN/bin or on PATH, \
             or set PROGNOZA_OPENVPN_CLI / PROGNOZA_OPENVPN_GUI"
        );
    };

    tracing::debug!(
        "OpenVPN detection: method={} cli={:?} gui={:?}",
        method.as_str(),
        cli_path,
        gui_path
    );
    Ok(Detection {
        method,
        cli_path,
        gui_path,
    })
}

/// Locate the OpenVPN binaries, preferring the CLI when both exist
pub fn find_openvpn(settings: &VpnSettings) -> Result<Detection> {
    find_openvpn_with(settings, &Locator::system())
}
