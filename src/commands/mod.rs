// Command module routing
//
// To add a new command:
// 1. Create a new file in this directory (e.g., `mycommand.rs`)
// 2. Add `pub mod mycommand;` below
// 3. Add the match arm in `handle_command` function

pub mod config;
pub mod poll;
pub mod serve;
pub mod umg;
pub mod vpn;

use crate::Commands;
use anyhow::Result;
use prognoza::settings::Settings;
use serde::Serialize;

/// Dispatch command to appropriate handler
pub fn handle_command(settings: &Settings, command: Commands) -> Result<()> {
    match command {
        Commands::Vpn { command } => vpn::handle_vpn(settings, command),
        Commands::Umg { command } => umg::handle_umg(settings, command),
        Commands::Poll {
            interval,
            cycles,
            forever,
            no_align,
        } => poll::handle_poll(settings, interval, cycles, forever, no_align),
        Commands::Serve { bind } => serve::handle_serve(settings, bind.as_deref()),
        Commands::Config { command } => config::handle_config(settings, command),
    }
}

/// JSON document printed when a command fails
pub fn error_document(error: &anyhow::Error, settings: &Settings) -> serde_json::Value {
    serde_json::json!({
        "error": format!("{:#}", error),
        "profile_name": settings.vpn.profile_name,
        "log_path": settings.vpn_log_file(),
    })
}

/// Print a value as pretty JSON on stdout
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_error_document_carries_context_and_paths() {
        let settings = Settings::with_base_dir("/srv/prognoza");
        let error = Err::<(), _>(anyhow::anyhow!("connection refused"))
            .context("UMG read failed")
            .unwrap_err();

        let document = error_document(&error, &settings);
        assert_eq!(document["error"], "UMG read failed: connection refused");
        assert_eq!(document["profile_name"], "Prognoza-UMG-509-PRO");
        assert_eq!(
            document["log_path"],
            serde_json::json!(settings.vpn_log_file())
        );
        assert_eq!(document.as_object().unwrap().len(), 3);
    }
}
