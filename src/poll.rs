//! Polling: one-shot reads through the tunnel, a foreground loop and a background worker

use crate::settings::PollSettings;
use crate::umg::{CsvExporter, Meter, Reading, UmgHealth};
use crate::vpn::{VpnConnection, VpnStatus};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(200);
const STOP_JOIN_BUDGET: Duration = Duration::from_secs(5);

/// The tunnel as seen by the poller
pub trait Tunnel: Send + Sync {
    fn status(&self) -> VpnStatus;
    fn connect(&self) -> VpnStatus;
    fn disconnect(&self) -> Result<()>;
}

impl Tunnel for VpnConnection {
    fn status(&self) -> VpnStatus {
        VpnConnection::status(self)
    }

    fn connect(&self) -> VpnStatus {
        VpnConnection::connect(self, None)
    }

    fn disconnect(&self) -> Result<()> {
        VpnConnection::disconnect(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollPayload {
    pub health: UmgHealth,
    pub data: Reading,
    pub csv_path: PathBuf,
    /// The tunnel was brought up (and torn down again) for this poll
    pub vpn_started: bool,
}

/// Read the meter once, bringing the tunnel up first if needed
pub fn poll_once(
    tunnel: &dyn Tunnel,
    meter: &dyn Meter,
    exporter: &CsvExporter,
    offset_seconds: f64,
) -> Result<PollPayload> {
    let mut vpn_started = false;
    if !tunnel.status().is_connected {
        let status = tunnel.connect();
        if !status.is_connected {
            if let Some(error) = &status.error {
                tracing::error!("VPN connect failed: {}", error);
            }
            anyhow::bail!("Unable to establish VPN tunnel before polling");
        }
        vpn_started = true;
    }

    let result = read_and_export(meter, exporter, offset_seconds, vpn_started);

    if vpn_started {
        if let Err(e) = tunnel.disconnect() {
            tracing::warn!("Disconnecting VPN after poll failed: {:#}", e);
        }
    }
    result
}

fn read_and_export(
    meter: &dyn Meter,
    exporter: &CsvExporter,
    offset_seconds: f64,
    vpn_started: bool,
) -> Result<PollPayload> {
    let health = meter.health();
    if !health.reachable {
        let detail = serde_json::to_string(&health).unwrap_or_default();
        anyhow::bail!("UMG device unreachable: {}", detail);
    }

    let mut reading = meter.read();
    reading.offset_seconds = offset_seconds;
    let csv_path = exporter
        .export(&reading)
        .context("Failed to export reading")?;
    tracing::info!(
        "Poll complete: status={} csv={}",
        reading.status.as_str(),
        csv_path.display()
    );

    Ok(PollPayload {
        health,
        data: reading,
        csv_path,
        vpn_started,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollOptions {
    pub interval: Duration,
    /// `None` polls until stopped
    pub cycles: Option<u32>,
    pub align_to_minute: bool,
}

impl PollOptions {
    pub fn from_settings(settings: &PollSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_s),
            cycles: Some(1),
            align_to_minute: settings.align_to_minute,
        }
    }

    fn pause(&self) -> Duration {
        self.interval.max(Duration::from_secs(1))
    }
}

/// Next multiple of `interval_ms` at or after `now_ms`, strictly after `after_ms`
pub fn next_boundary_ms(now_ms: i64, interval_ms: i64, after_ms: Option<i64>) -> i64 {
    let interval_ms = interval_ms.max(1000);
    let mut boundary = now_ms.div_euclid(interval_ms) * interval_ms;
    if boundary < now_ms {
        boundary += interval_ms;
    }
    if let Some(after) = after_ms {
        while boundary <= after {
            boundary += interval_ms;
        }
    }
    boundary
}

/// Sleep until `deadline` in short slices; false if `stop` was raised first
fn sleep_until(deadline: Instant, stop: &AtomicBool) -> bool {
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Run `job` until `cycles` are done or `stop` is raised, returning the cycles run.
///
/// `job` receives the start offset from the interval boundary in seconds.
pub fn poll_loop<J, C>(options: &PollOptions, stop: &AtomicBool, mut job: J, mut callback: C) -> Result<u32>
where
    J: FnMut(f64) -> Result<PollPayload>,
    C: FnMut(&PollPayload),
{
    let interval_ms = i64::try_from(options.pause().as_millis()).unwrap_or(i64::MAX);
    let mut executed = 0u32;
    let mut last_boundary: Option<i64> = None;

    while options.cycles.is_none_or(|cycles| executed < cycles) {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let offset_seconds = if options.align_to_minute {
            let boundary = next_boundary_ms(now_ms(), interval_ms, last_boundary);
            let wait = Duration::from_millis(u64::try_from(boundary - now_ms()).unwrap_or(0));
            if !sleep_until(Instant::now() + wait, stop) {
                break;
            }
            last_boundary = Some(boundary);
            (now_ms() - boundary) as f64 / 1000.0
        } else {
            0.0
        };

        let payload = job(offset_seconds)?;
        callback(&payload);
        executed += 1;

        if options.cycles.is_some_and(|cycles| executed >= cycles) {
            break;
        }
        if !options.align_to_minute && !sleep_until(Instant::now() + options.pause(), stop) {
            break;
        }
    }
    Ok(executed)
}

pub type PollJob = Arc<dyn Fn(f64) -> Result<PollPayload> + Send + Sync>;

/// Production poll job: tunnel, meter and exporter shared with the dashboard
pub fn poll_job(tunnel: Arc<dyn Tunnel>, meter: Arc<dyn Meter>, exports_dir: &Path) -> PollJob {
    let exporter = CsvExporter::new(exports_dir);
    Arc::new(move |offset| poll_once(tunnel.as_ref(), meter.as_ref(), &exporter, offset))
}

#[derive(Debug, Clone, Serialize)]
pub struct PollerSnapshot {
    pub running: bool,
    pub last_payload: Option<PollPayload>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Worker {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

/// Poll loop running on its own thread
#[derive(Default)]
pub struct BackgroundPoller {
    worker: Mutex<Worker>,
    last_payload: Arc<Mutex<Option<PollPayload>>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl BackgroundPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, options: PollOptions, job: PollJob) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| anyhow::anyhow!("Poller state poisoned"))?;
        if worker.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            anyhow::bail!("Polling already running");
        }

        let stop = Arc::new(AtomicBool::new(false));
        if let Ok(mut error) = self.last_error.lock() {
            *error = None;
        }
        let last_payload = Arc::clone(&self.last_payload);
        let last_error = Arc::clone(&self.last_error);
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("umg-poller".to_string())
            .spawn(move || {
                let store = |payload: &PollPayload| {
                    if let Ok(mut last) = last_payload.lock() {
                        *last = Some(payload.clone());
                    }
                };
                let outcome = poll_loop(&options, &thread_stop, |offset| job(offset), store);
                match outcome {
                    Ok(cycles) => tracing::info!("Background polling finished after {} cycles", cycles),
                    Err(e) => {
                        tracing::error!("Background polling failed: {:#}", e);
                        if let Ok(mut error) = last_error.lock() {
                            *error = Some(format!("{:#}", e));
                        }
                    }
                }
            })
            .context("Failed to spawn poller thread")?;

        worker.handle = Some(handle);
        worker.stop = stop;
        tracing::info!("Background polling started");
        Ok(())
    }

    /// Ask the loop to stop; true if one was running
    pub fn stop(&self) -> bool {
        let (handle, stop) = match self.worker.lock() {
            Ok(mut worker) => (worker.handle.take(), Arc::clone(&worker.stop)),
            Err(_) => return false,
        };
        let Some(handle) = handle else {
            return false;
        };
        if handle.is_finished() {
            let _ = handle.join();
            return false;
        }

        stop.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + STOP_JOIN_BUDGET;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            tracing::warn!("Poller did not stop within {:?}, detaching", STOP_JOIN_BUDGET);
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|w| w.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    pub fn last_payload(&self) -> Option<PollPayload> {
        self.last_payload.lock().ok().and_then(|p| p.clone())
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn snapshot(&self) -> PollerSnapshot {
        PollerSnapshot {
            running: self.is_running(),
            last_payload: self.last_payload(),
            last_error: self.last_error(),
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::umg::ReadingStatus;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    pub struct FakeTunnel {
        pub connected: AtomicBool,
        pub can_connect: bool,
        pub connects: AtomicUsize,
        pub disconnects: AtomicUsize,
    }

    impl FakeTunnel {
        pub fn new(connected: bool, can_connect: bool) -> Self {
            Self {
                connected: AtomicBool::new(connected),
                can_connect,
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
            }
        }

        fn snapshot(&self) -> VpnStatus {
            let mut status = VpnStatus::disconnected("Prognoza-UMG-509-PRO", Path::new("vpn.log"), None);
            status.is_connected = self.connected.load(Ordering::SeqCst);
            status
        }
    }

    impl Tunnel for FakeTunnel {
        fn status(&self) -> VpnStatus {
            self.snapshot()
        }

        fn connect(&self) -> VpnStatus {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(self.can_connect, Ordering::SeqCst);
            self.snapshot()
        }

        fn disconnect(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct FakeMeter {
        pub reachable: bool,
        pub reads: AtomicUsize,
    }

    impl FakeMeter {
        pub fn new(reachable: bool) -> Self {
            Self {
                reachable,
                reads: AtomicUsize::new(0),
            }
        }
    }

    impl Meter for FakeMeter {
        fn health(&self) -> UmgHealth {
            UmgHealth {
                http_ms: Some(12.5),
                modbus_ms: self.reachable.then_some(8.25),
                reachable: self.reachable,
            }
        }

        fn read(&self) -> Reading {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Reading {
                timestamp: chrono::Local::now(),
                status: ReadingStatus::Ok,
                error: None,
                offset_seconds: 0.0,
                values: vec![("frequency".to_string(), Some(50.0))],
            }
        }
    }

    pub fn exporter(dir: &Path) -> CsvExporter {
        CsvExporter::new(dir)
    }
}
