//! Layered settings: defaults, `prognoza.toml`, `.env`, then `PROGNOZA_*` variables.

use crate::umg::registers::{RegisterSpec, default_registers};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "prognoza.toml";
pub const HOME_ENV: &str = "PROGNOZA_HOME";
pub const OVPN_PATH_ENV: &str = "PROGNOZA_OVPN_PATH";
pub const PROFILE_NAME_ENV: &str = "PROGNOZA_PROFILE_NAME";
pub const PREFERRED_METHOD_ENV: &str = "PROGNOZA_OPENVPN_METHOD";
pub const CLI_OVERRIDE_ENV: &str = "PROGNOZA_OPENVPN_CLI";
pub const GUI_OVERRIDE_ENV: &str = "PROGNOZA_OPENVPN_GUI";
pub const UMG_HOST_ENV: &str = "PROGNOZA_UMG_HOST";
pub const UMG_MODBUS_PORT_ENV: &str = "PROGNOZA_UMG_MODBUS_PORT";
pub const DASHBOARD_BIND_ENV: &str = "PROGNOZA_DASHBOARD_BIND";

const DEFAULT_PROFILE_NAME: &str = "Prognoza-UMG-509-PRO";

/// Which OpenVPN front end drives the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MethodPreference {
    #[default]
    Auto,
    Cli,
    Gui,
}

impl MethodPreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "auto" | "" => Some(Self::Auto),
            "cli" => Some(Self::Cli),
            "gui" => Some(Self::Gui),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnSettings {
    /// Profile used when no path is given on the command line
    pub ovpn_path: Option<PathBuf>,
    pub profile_name: String,
    pub method: MethodPreference,
    pub cli_path: Option<PathBuf>,
    pub gui_path: Option<PathBuf>,
    pub connect_timeout_s: u64,
    /// Minimum number of health attempts after the tunnel comes up
    pub health_attempts: u32,
}

impl Default for VpnSettings {
    fn default() -> Self {
        Self {
            ovpn_path: None,
            profile_name: DEFAULT_PROFILE_NAME.to_string(),
            method: MethodPreference::Auto,
            cli_path: None,
            gui_path: None,
            connect_timeout_s: 60,
            health_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UmgSettings {
    pub host: String,
    pub http_port: u16,
    pub modbus_port: u16,
    pub unit_id: u8,
    pub timeout_s: f64,
    pub registers: Vec<RegisterSpec>,
}

impl Default for UmgSettings {
    fn default() -> Self {
        Self {
            host: "192.168.1.30".to_string(),
            http_port: 80,
            modbus_port: 502,
            unit_id: 1,
            timeout_s: 3.0,
            registers: default_registers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_s: u64,
    pub align_to_minute: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_s: 60,
            align_to_minute: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardSettings {
    pub bind: String,
    pub refresh_s: u64,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            refresh_s: 300,
        }
    }
}

/// Contents of `prognoza.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub vpn: VpnSettings,
    pub umg: UmgSettings,
    pub poll: PollSettings,
    pub dashboard: DashboardSettings,
}

/// Effective settings with every directory resolved against the base directory
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_dir: PathBuf,
    pub vpn: VpnSettings,
    pub umg: UmgSettings,
    pub poll: PollSettings,
    pub dashboard: DashboardSettings,
}

impl Settings {
    /// Settings rooted at `base_dir` with built-in defaults only
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self::from_file_config(base_dir.into(), FileConfig::default())
    }

    fn from_file_config(base_dir: PathBuf, file: FileConfig) -> Self {
        Self {
            base_dir,
            vpn: file.vpn,
            umg: file.umg,
            poll: file.poll,
            dashboard: file.dashboard,
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir().join("raw")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir().join("exports")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.base_dir.join("secrets")
    }

    /// Extracted certificates and the clean profile live here
    pub fn assets_dir(&self) -> PathBuf {
        self.secrets_dir().join("ovpn_assets")
    }

    pub fn default_ovpn_path(&self) -> PathBuf {
        match &self.vpn.ovpn_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.base_dir.join(path),
            None => self
                .secrets_dir()
                .join(format!("{}.ovpn", DEFAULT_PROFILE_NAME)),
        }
    }

    /// OpenVPN's own log, scanned for failure signatures
    pub fn vpn_log_file(&self) -> PathBuf {
        self.raw_dir().join("vpn.log")
    }

    pub fn vpn_pid_file(&self) -> PathBuf {
        self.raw_dir().join("vpn.pid")
    }

    pub fn app_log_dir(&self) -> PathBuf {
        self.raw_dir()
    }

    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE_NAME)
    }

    /// Create the data, raw, exports and secrets directories
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.data_dir(),
            self.raw_dir(),
            self.exports_dir(),
            self.secrets_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Apply `PROGNOZA_*` overrides using `lookup` to read variables
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(OVPN_PATH_ENV) {
            self.vpn.ovpn_path = Some(PathBuf::from(path));
        }
        if let Some(name) = lookup(PROFILE_NAME_ENV) {
            self.vpn.profile_name = name;
        }
        if let Some(method) = lookup(PREFERRED_METHOD_ENV) {
            self.vpn.method = MethodPreference::parse(&method).with_context(|| {
                format!(
                    "Invalid {}: '{}' (expected cli, gui or auto)",
                    PREFERRED_METHOD_ENV, method
                )
            })?;
        }
        if let Some(path) = lookup(CLI_OVERRIDE_ENV) {
            self.vpn.cli_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup(GUI_OVERRIDE_ENV) {
            self.vpn.gui_path = Some(PathBuf::from(path));
        }
        if let Some(host) = lookup(UMG_HOST_ENV) {
            self.umg.host = host;
        }
        if let Some(port) = lookup(UMG_MODBUS_PORT_ENV) {
            self.umg.modbus_port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", UMG_MODBUS_PORT_ENV, port))?;
        }
        if let Some(bind) = lookup(DASHBOARD_BIND_ENV) {
            self.dashboard.bind = bind;
        }
        Ok(())
    }

    /// Serialize the file-backed part of the settings
    pub fn to_toml(&self) -> Result<String> {
        let file = FileConfig {
            vpn: self.vpn.clone(),
            umg: self.umg.clone(),
            poll: self.poll.clone(),
            dashboard: self.dashboard.clone(),
        };
        toml::to_string_pretty(&file).context("Failed to serialize settings")
    }
}

/// Resolve the base directory from the flag, `PROGNOZA_HOME`, or the working directory
pub fn resolve_base_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    std::env::current_dir().context("Could not determine working directory")
}

pub fn get_home_dir() -> Result<PathBuf> {
    std::env::var("USERPROFILE")
        .or_else(|_| std::env::var("HOME"))
        .map(PathBuf::from)
        .with_context(|| "Could not determine home directory")
}

pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Load effective settings and create the runtime directories
pub fn load_settings(base_dir: Option<&Path>, config_file: Option<&Path>) -> Result<Settings> {
    let base_dir = resolve_base_dir(base_dir)?;

    let env_path = base_dir.join(".env");
    if env_path.exists() {
        dotenv::from_path(&env_path)
            .with_context(|| format!("Failed to load {}", env_path.display()))?;
    }

    let config_path = config_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| base_dir.join(CONFIG_FILE_NAME));
    let file = load_file_config(&config_path)?;

    let mut settings = Settings::from_file_config(base_dir, file);
    settings.apply_env_overrides(|key| std::env::var(key).ok())?;
    settings.ensure_dirs()?;
    Ok(settings)
}

/// Write a default `prognoza.toml` into the base directory
pub fn init_config_file(settings: &Settings, force: bool) -> Result<PathBuf> {
    let path = settings.config_file();
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    let defaults = Settings::with_base_dir(&settings.base_dir);
    fs::write(&path, defaults.to_toml()?)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(path)
}
