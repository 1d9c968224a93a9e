//! Tunnel orchestration: prepare the profile, bring the tunnel up and check the UMG behind it

use super::backend::{
    Detection, Locator, Method, TunnelBackend, UnavailableBackend, find_openvpn, find_openvpn_with,
};
use super::cli::CliBackend;
use super::diagnostics;
use super::gui::GuiBackend;
use super::profile::extract_assets;
use super::resolve::resolve_config_path;
use crate::settings::Settings;
use crate::utils::backoff::{Backoff, retry_until};
use crate::utils::networking;
use anyhow::Result;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

const STATUS_HEALTH_BUDGET: Duration = Duration::from_secs(5);
const PING_TIMEOUT_MS: u64 = 1000;
const TCP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthChecks {
    pub ping: bool,
    pub tcp: bool,
}

/// Snapshot of the tunnel and the UMG behind it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VpnStatus {
    pub is_connected: bool,
    pub running: bool,
    pub method: Option<Method>,
    pub vpn_ip: Option<Ipv4Addr>,
    pub umg_ok: bool,
    pub pid: Option<u32>,
    pub profile_name: String,
    pub config_path: Option<PathBuf>,
    pub log_path: PathBuf,
    pub checks: HealthChecks,
    pub message: Option<String>,
    pub error: Option<String>,
    pub elapsed_s: Option<f64>,
}

impl VpnStatus {
    pub fn disconnected(profile_name: &str, log_path: &Path, method: Option<Method>) -> Self {
        Self {
            is_connected: false,
            running: false,
            method,
            vpn_ip: None,
            umg_ok: false,
            pid: None,
            profile_name: profile_name.to_string(),
            config_path: None,
            log_path: log_path.to_path_buf(),
            checks: HealthChecks::default(),
            message: None,
            error: None,
            elapsed_s: None,
        }
    }

    fn add_message(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.message = Some(match self.message.take() {
            Some(existing) => format!("{} {}", existing, text),
            None => text,
        });
    }
}

/// Host-side network observations used by health checks
pub trait NetworkProbe: Send + Sync {
    fn tunnel_ip(&self) -> Option<Ipv4Addr>;
    fn ping(&self, host: &str) -> bool;
    fn tcp(&self, host: &str, port: u16) -> bool;
}

pub struct SystemProbe;

impl NetworkProbe for SystemProbe {
    fn tunnel_ip(&self) -> Option<Ipv4Addr> {
        networking::tunnel_ipv4()
    }

    fn ping(&self, host: &str) -> bool {
        networking::ping_host(host, PING_TIMEOUT_MS)
    }

    fn tcp(&self, host: &str, port: u16) -> bool {
        networking::check_tcp(host, port, TCP_TIMEOUT)
    }
}

pub struct VpnConnection {
    settings: Settings,
    backend: Box<dyn TunnelBackend>,
    /// CLI used when the GUI has no installed profile or cannot install one
    fallback: Option<Box<dyn TunnelBackend>>,
    probe: Box<dyn NetworkProbe>,
    backoff: Backoff,
    /// Why no OpenVPN front end could be used, if none was found
    unavailable: Option<String>,
    last_status: Mutex<Option<VpnStatus>>,
}

type Backends = (Box<dyn TunnelBackend>, Option<Box<dyn TunnelBackend>>);

fn build_backends(settings: &Settings, detection: Detection) -> Result<Backends> {
    let cli = detection.cli_path.clone().map(|binary| {
        Box::new(CliBackend::new(
            binary,
            &settings.vpn.profile_name,
            settings.vpn_log_file(),
            settings.vpn_pid_file(),
        )) as Box<dyn TunnelBackend>
    });

    match (detection.method, detection.gui_path) {
        (Method::Gui, Some(gui)) => {
            let gui: Box<dyn TunnelBackend> =
                Box::new(GuiBackend::new(gui, &settings.vpn.profile_name)?);
            Ok((gui, cli))
        }
        (_, _) => match cli {
            Some(cli) => Ok((cli, None)),
            None => anyhow::bail!("OpenVPN CLI selected but no openvpn binary was found"),
        },
    }
}

impl VpnConnection {
    /// Detect the installed OpenVPN front ends and build the matching backend
    pub fn from_settings(settings: &Settings) -> Self {
        Self::from_detection(settings, find_openvpn(&settings.vpn))
    }

    /// Like `from_settings`, searching binaries with `locator`
    pub fn with_locator(settings: &Settings, locator: &Locator) -> Self {
        Self::from_detection(settings, find_openvpn_with(&settings.vpn, locator))
    }

    /// A failed detection still yields a connection that can report status
    fn from_detection(settings: &Settings, detection: Result<Detection>) -> Self {
        match detection.and_then(|detection| build_backends(settings, detection)) {
            Ok((backend, fallback)) => {
                Self::with_parts(settings.clone(), backend, fallback, Box::new(SystemProbe))
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                tracing::warn!("OpenVPN unavailable: {}", reason);
                Self::unavailable(settings.clone(), reason, Box::new(SystemProbe))
            }
        }
    }

    pub fn unavailable(settings: Settings, reason: String, probe: Box<dyn NetworkProbe>) -> Self {
        let backend = Box::new(UnavailableBackend {
            profile_name: settings.vpn.profile_name.clone(),
            reason: reason.clone(),
        });
        let mut connection = Self::with_parts(settings, backend, None, probe);
        connection.unavailable = Some(reason);
        connection
    }

    pub fn with_parts(
        settings: Settings,
        backend: Box<dyn TunnelBackend>,
        fallback: Option<Box<dyn TunnelBackend>>,
        probe: Box<dyn NetworkProbe>,
    ) -> Self {
        Self {
            settings,
            backend,
            fallback,
            probe,
            backoff: Backoff::default(),
            unavailable: None,
            last_status: Mutex::new(None),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn last_status(&self) -> Option<VpnStatus> {
        self.last_status.lock().ok().and_then(|s| s.clone())
    }

    fn remember(&self, status: &VpnStatus) {
        if let Ok(mut last) = self.last_status.lock() {
            *last = Some(status.clone());
        }
    }

    fn blank_status(&self) -> VpnStatus {
        VpnStatus::disconnected(
            &self.settings.vpn.profile_name,
            &self.settings.vpn_log_file(),
            self.unavailable.is_none().then(|| self.backend.method()),
        )
    }

    fn requested_path(&self, ovpn: Option<&Path>) -> PathBuf {
        ovpn.map(Path::to_path_buf)
            .unwrap_or_else(|| self.settings.default_ovpn_path())
    }

    /// Bring the tunnel up and verify the UMG answers; failures end up in the status
    pub fn connect(&self, ovpn: Option<&Path>) -> VpnStatus {
        let started = Instant::now();
        let mut status = self.blank_status();

        if let Err(e) = self.establish(&mut status, &self.requested_path(ovpn)) {
            tracing::error!("Connection routine failed: {:#}", e);
            status.error = Some(format!("{:#}", e));
        }

        if !status.is_connected {
            for hint in diagnostics::hints_from_log(&self.settings.vpn_log_file()) {
                status.add_message(hint);
            }
        }

        status.elapsed_s = Some((started.elapsed().as_secs_f64() * 100.0).round() / 100.0);
        self.remember(&status);
        status
    }

    fn establish(&self, status: &mut VpnStatus, requested: &Path) -> Result<()> {
        let settings = &self.settings;
        let resolved = resolve_config_path(requested, &settings.base_dir, &settings.secrets_dir())?;
        status.config_path = Some(resolved.path.clone());
        if let Some(note) = resolved.note {
            status.add_message(note);
        }

        let assets_dir = settings.assets_dir();
        let report = extract_assets(
            &resolved.path,
            &assets_dir,
            &settings.vpn.profile_name,
            &settings.umg.host,
        )?;
        let backend = self.prepare_backend(status, &report.profile, &assets_dir)?;

        status.pid = backend.start(&report.profile, &assets_dir)?;
        status.running = true;

        let timeout = Duration::from_secs(settings.vpn.connect_timeout_s);
        let vpn_ip = retry_until(timeout, self.backoff, || self.probe.tunnel_ip());
        let Some(vpn_ip) = vpn_ip else {
            anyhow::bail!("Timed out waiting for TUN/TAP interface to obtain an IPv4 address.");
        };
        tracing::info!("Obtained VPN interface IP {}", vpn_ip);
        status.vpn_ip = Some(vpn_ip);

        let checks = self.check_umg(timeout, settings.vpn.health_attempts);
        status.checks = checks;
        status.umg_ok = checks.ping && checks.tcp;
        status.is_connected = status.umg_ok;

        if status.pid.is_none() {
            status.pid = backend.pid();
        }

        if status.is_connected {
            tracing::info!(
                "VPN connected: ip={} ping={} tcp={} pid={:?}",
                vpn_ip,
                checks.ping,
                checks.tcp,
                status.pid
            );
            status.add_message("VPN connected");
        } else {
            tracing::error!("VPN health check failed: ping={} tcp={}", checks.ping, checks.tcp);
            status.add_message(format!(
                "Tunnel is up but the UMG at {} did not answer (ping={}, tcp={}).",
                settings.umg.host, checks.ping, checks.tcp
            ));
        }
        Ok(())
    }

    /// Prepare the primary backend, switching to the CLI fallback when the
    /// GUI cannot take the profile
    fn prepare_backend(
        &self,
        status: &mut VpnStatus,
        clean_profile: &Path,
        assets_dir: &Path,
    ) -> Result<&dyn TunnelBackend> {
        let error = match self.backend.prepare(clean_profile, assets_dir) {
            Ok(()) => return Ok(self.backend.as_ref()),
            Err(e) => e,
        };
        let Some(fallback) = self.fallback.as_deref() else {
            return Err(error);
        };

        tracing::warn!("OpenVPN GUI setup failed, using the CLI: {:#}", error);
        fallback.prepare(clean_profile, assets_dir)?;
        status.method = Some(fallback.method());
        status.add_message(format!(
            "OpenVPN GUI setup failed ({:#}); using the OpenVPN CLI instead.",
            error
        ));
        Ok(fallback)
    }

    /// Ping plus TCP probe of the UMG until both succeed, the budget runs out
    /// and at least `min_attempts` were made
    fn check_umg(&self, budget: Duration, min_attempts: u32) -> HealthChecks {
        let host = &self.settings.umg.host;
        let port = self.settings.umg.http_port;
        let deadline = Instant::now() + budget;
        let floor = self.backoff.initial.min(Duration::from_millis(500));
        let mut delays = self.backoff.delays();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let checks = HealthChecks {
                ping: self.probe.ping(host),
                tcp: self.probe.tcp(host, port),
            };
            tracing::info!(
                "UMG health attempt {}: ping={} tcp={}",
                attempts,
                checks.ping,
                checks.tcp
            );
            if checks.ping && checks.tcp {
                return checks;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && attempts >= min_attempts {
                return checks;
            }
            let delay = delays.next().unwrap_or(self.backoff.max);
            let pause = if remaining.is_zero() {
                floor
            } else {
                delay.min(remaining).max(floor)
            };
            thread::sleep(pause);
        }
    }

    /// Stop the tunnel; the remembered status is reset even if stopping fails
    pub fn disconnect(&self) -> Result<()> {
        let mut result = self.backend.stop().and_then(|()| match self.backend.method() {
            Method::Gui => self.backend.stop_all(),
            Method::Cli => Ok(()),
        });
        if let Some(fallback) = self.fallback.as_deref() {
            result = result.and(fallback.stop());
        }
        let mut reset = self.blank_status();
        reset.message = Some("VPN disconnected".to_string());
        self.remember(&reset);
        tracing::info!("Profile {} disconnected", self.settings.vpn.profile_name);
        result
    }

    /// Current tunnel state for the configured profile
    pub fn status(&self) -> VpnStatus {
        self.status_for(None)
    }

    /// Current tunnel state, recording which profile file `ovpn` resolves to
    pub fn status_for(&self, ovpn: Option<&Path>) -> VpnStatus {
        let mut status = self.blank_status();
        let settings = &self.settings;

        match resolve_config_path(&self.requested_path(ovpn), &settings.base_dir, &settings.secrets_dir()) {
            Ok(resolved) => {
                status.config_path = Some(resolved.path);
                if let Some(note) = resolved.note {
                    status.add_message(note);
                }
            }
            Err(e) => status.error = Some(e.to_string()),
        }

        if let Some(reason) = &self.unavailable {
            status.add_message(reason.clone());
        }

        let backend = if self.backend.profile_available() {
            self.backend.as_ref()
        } else if let Some(fallback) = self.fallback.as_deref() {
            tracing::info!("OpenVPN GUI profile missing, checking the CLI tunnel instead");
            fallback
        } else {
            status.add_message(format!(
                "OpenVPN GUI profile '{}' is not installed; run `prognoza vpn connect` first.",
                settings.vpn.profile_name
            ));
            self.remember(&status);
            return status;
        };
        if self.unavailable.is_none() {
            status.method = Some(backend.method());
        }

        status.pid = backend.pid();
        status.running = status.pid.is_some();
        status.vpn_ip = self.probe.tunnel_ip();

        if status.running && status.vpn_ip.is_some() {
            status.checks = self.check_umg(STATUS_HEALTH_BUDGET, 1);
            status.umg_ok = status.checks.ping && status.checks.tcp;
        }
        status.is_connected = status.running && status.vpn_ip.is_some() && status.umg_ok;

        let summary = if status.is_connected {
            "VPN connected".to_string()
        } else if !status.running {
            "OpenVPN is not running.".to_string()
        } else if status.vpn_ip.is_none() {
            "OpenVPN is running but the tunnel has no IPv4 address yet.".to_string()
        } else {
            format!("UMG at {} is not reachable through the tunnel.", settings.umg.host)
        };
        status.add_message(summary);

        self.remember(&status);
        status
    }
}

/// Status of the tunnel for the profile at `path`
pub fn vpn_status(settings: &Settings, path: &Path) -> VpnStatus {
    VpnConnection::from_settings(settings).status_for(Some(path))
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Backend whose process appears once `start` is called
    #[derive(Default)]
    pub struct FakeBackend {
        pub gui: bool,
        pub available: bool,
        pub prepare_fails: bool,
        pub running: Arc<AtomicBool>,
        pub starts: Arc<AtomicUsize>,
        pub stops: Arc<AtomicUsize>,
    }

    impl TunnelBackend for FakeBackend {
        fn method(&self) -> Method {
            if self.gui { Method::Gui } else { Method::Cli }
        }

        fn prepare(&self, clean_profile: &Path, _assets_dir: &Path) -> Result<()> {
            anyhow::ensure!(!self.prepare_fails, "config folder is read-only");
            anyhow::ensure!(clean_profile.exists(), "clean profile missing");
            Ok(())
        }

        fn start(&self, _clean_profile: &Path, _assets_dir: &Path) -> Result<Option<u32>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            Ok(Some(4242))
        }

        fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn pid(&self) -> Option<u32> {
            self.running.load(Ordering::SeqCst).then_some(4242)
        }

        fn profile_available(&self) -> bool {
            self.available
        }
    }

    /// Probe whose tunnel IP follows a shared "tunnel up" flag
    pub struct FakeProbe {
        pub tunnel_up: Arc<AtomicBool>,
        pub umg_up: bool,
        pub pings: Arc<AtomicUsize>,
    }

    impl NetworkProbe for FakeProbe {
        fn tunnel_ip(&self) -> Option<Ipv4Addr> {
            self.tunnel_up
                .load(Ordering::SeqCst)
                .then_some(Ipv4Addr::new(10, 8, 0, 6))
        }

        fn ping(&self, _host: &str) -> bool {
            self.pings.fetch_add(1, Ordering::SeqCst);
            self.umg_up
        }

        fn tcp(&self, _host: &str, _port: u16) -> bool {
            self.umg_up
        }
    }

    pub fn fast_backoff() -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            factor: 1.0,
            max: Duration::from_millis(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Fixture {
        _dir: tempfile::TempDir,
        connection: VpnConnection,
        running: Arc<AtomicBool>,
        pings: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    fn fixture(umg_up: bool, gui: bool, available: bool, with_fallback: bool) -> Fixture {
        fixture_with(umg_up, gui, available, false, with_fallback)
    }

    fn settings_in(dir: &Path) -> Settings {
        let mut settings = Settings::with_base_dir(dir);
        settings.vpn.connect_timeout_s = 1;
        settings.ensure_dirs().unwrap();
        fs::write(
            settings.default_ovpn_path(),
            "client\nremote vpn.example.net 1194\n<ca>\nCA\n</ca>\n",
        )
        .unwrap();
        settings
    }

    fn fixture_with(
        umg_up: bool,
        gui: bool,
        available: bool,
        prepare_fails: bool,
        with_fallback: bool,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());

        let running = Arc::new(AtomicBool::new(false));
        let pings = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let backend = FakeBackend {
            gui,
            available,
            prepare_fails,
            running: running.clone(),
            stops: stops.clone(),
            ..FakeBackend::default()
        };
        let fallback = with_fallback.then(|| {
            Box::new(FakeBackend {
                available: true,
                running: running.clone(),
                ..FakeBackend::default()
            }) as Box<dyn TunnelBackend>
        });
        let probe = FakeProbe {
            tunnel_up: running.clone(),
            umg_up,
            pings: pings.clone(),
        };

        let connection =
            VpnConnection::with_parts(settings, Box::new(backend), fallback, Box::new(probe))
                .with_backoff(fast_backoff());
        Fixture {
            _dir: dir,
            connection,
            running,
            pings,
            stops,
        }
    }

    #[test]
    fn test_connect_succeeds_when_umg_answers() {
        let f = fixture(true, false, true, false);
        let status = f.connection.connect(None);

        assert!(status.is_connected, "{:?}", status);
        assert_eq!(status.vpn_ip, Some(Ipv4Addr::new(10, 8, 0, 6)));
        assert_eq!(status.pid, Some(4242));
        assert_eq!(status.checks, HealthChecks { ping: true, tcp: true });
        assert!(status.elapsed_s.is_some());
        assert_eq!(f.connection.last_status(), Some(status));
    }

    #[test]
    fn test_connect_makes_minimum_health_attempts() {
        let f = fixture(false, false, true, false);
        let status = f.connection.connect(None);

        assert!(!status.is_connected);
        assert!(status.running);
        assert!(!status.umg_ok);
        assert!(f.pings.load(Ordering::SeqCst) >= 3);
        assert!(status.message.unwrap().contains("did not answer"));
    }

    #[test]
    fn test_connect_reports_missing_profile() {
        let f = fixture(true, false, true, false);
        let status = f.connection.connect(Some(Path::new("nowhere/absent.ovpn")));

        assert!(!status.is_connected);
        assert!(
            status
                .error
                .unwrap()
                .starts_with("Configuration file not found: nowhere/absent.ovpn")
        );
        assert!(!f.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_connect_appends_log_hints() {
        let f = fixture(false, false, true, false);
        fs::write(
            f.connection.settings.vpn_log_file(),
            "Open TAP device failed: Access is denied.\n",
        )
        .unwrap();

        let status = f.connection.connect(None);
        assert!(status.message.unwrap().contains("Administrator"));
    }

    #[test]
    fn test_status_reflects_running_tunnel() {
        let f = fixture(true, false, true, false);
        assert!(!f.connection.status().running);

        f.running.store(true, Ordering::SeqCst);
        let status = f.connection.status();
        assert!(status.is_connected);
        assert!(status.config_path.is_some());
        assert_eq!(status.message.as_deref(), Some("VPN connected"));
    }

    #[test]
    fn test_disconnect_resets_status_and_stops_all_for_gui() {
        let f = fixture(true, true, true, false);
        f.connection.connect(None);
        f.connection.disconnect().unwrap();

        // stop, then stop_all which defaults to stop
        assert_eq!(f.stops.load(Ordering::SeqCst), 2);
        let last = f.connection.last_status().unwrap();
        assert!(!last.is_connected);
        assert_eq!(last.vpn_ip, None);
        assert!(!f.connection.status().running);
    }

    #[test]
    fn test_status_without_gui_profile_falls_back_to_cli() {
        let f = fixture(true, true, false, true);
        f.running.store(true, Ordering::SeqCst);

        let status = f.connection.status();
        assert_eq!(status.method, Some(Method::Cli));
        assert!(status.is_connected);
    }

    #[test]
    fn test_status_without_gui_profile_or_cli() {
        let f = fixture(true, true, false, false);
        f.running.store(true, Ordering::SeqCst);

        let status = f.connection.status();
        assert!(!status.running);
        assert!(!status.is_connected);
        assert!(status.message.unwrap().contains("OpenVPN GUI profile"));
    }

    #[test]
    fn test_connect_falls_back_to_cli_when_gui_setup_fails() {
        let f = fixture_with(true, true, false, true, true);
        let status = f.connection.connect(None);

        assert!(status.is_connected, "{:?}", status);
        assert_eq!(status.method, Some(Method::Cli));
        assert!(status.message.unwrap().contains("using the OpenVPN CLI"));
    }

    #[test]
    fn test_connect_reports_gui_setup_failure_without_cli() {
        let f = fixture_with(true, true, false, true, false);
        let status = f.connection.connect(None);

        assert!(!status.is_connected);
        assert!(status.error.unwrap().contains("config folder is read-only"));
        assert!(!f.running.load(Ordering::SeqCst));
    }

    fn nothing_on_path(_: &str) -> Option<PathBuf> {
        None
    }

    #[test]
    fn test_status_without_openvpn_installed() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_in(dir.path());
        settings.vpn.profile_name = "Prognoza-Status-Without-OpenVPN".to_string();
        let locator = Locator {
            program_roots: vec![],
            on_path: nothing_on_path,
        };

        let connection = VpnConnection::with_locator(&settings, &locator);
        let status = connection.status();
        assert!(!status.running);
        assert!(!status.is_connected);
        assert_eq!(status.method, None);
        assert!(status.message.unwrap().contains("OpenVPN not found"));

        let attempt = connection.connect(None);
        assert!(!attempt.is_connected);
        assert!(attempt.error.unwrap().contains("OpenVPN not found"));
    }
}
