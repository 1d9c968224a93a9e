use super::print_json;
use anyhow::{Context, Result};
use prognoza::poll::{PollOptions, Tunnel, poll_job, poll_loop};
use prognoza::settings::Settings;
use prognoza::umg::{Meter, UmgClient};
use prognoza::vpn::VpnConnection;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub fn handle_poll(
    settings: &Settings,
    interval: Option<u64>,
    cycles: Option<u32>,
    forever: bool,
    no_align: bool,
) -> Result<()> {
    let mut options = PollOptions::from_settings(&settings.poll);
    if let Some(secs) = interval {
        options.interval = Duration::from_secs(secs);
    }
    options.cycles = if forever { None } else { Some(cycles.unwrap_or(1)) };
    if no_align {
        options.align_to_minute = false;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nStopping after the current cycle...");
        handler_stop.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    let tunnel: Arc<dyn Tunnel> = Arc::new(VpnConnection::from_settings(settings));
    let meter: Arc<dyn Meter> = Arc::new(UmgClient::from_settings(&settings.umg));
    let job = poll_job(tunnel, meter, &settings.exports_dir());

    let executed = poll_loop(&options, &stop, |offset| job(offset), |payload| {
        if let Err(e) = print_json(payload) {
            tracing::warn!("Could not print payload: {}", e);
        }
    })?;
    println!("✓ Completed {} poll cycle(s)", executed);
    Ok(())
}
