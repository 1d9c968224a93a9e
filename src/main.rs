mod commands;

use clap::{Parser, Subcommand};
use commands::config::ConfigCommands;
use commands::umg::UmgCommands;
use commands::vpn::VpnCommands;
use prognoza::settings::{self, Settings};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "prognoza")]
#[command(about = "OpenVPN tunnel control and Janitza UMG polling", long_about = None)]
struct Cli {
    /// Base directory holding data/, secrets/ and prognoza.toml
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
    /// Configuration file (defaults to <base-dir>/prognoza.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the OpenVPN tunnel to the UMG
    Vpn {
        #[command(subcommand)]
        command: VpnCommands,
    },
    /// Talk to the UMG meter directly
    Umg {
        #[command(subcommand)]
        command: UmgCommands,
    },
    /// Poll the UMG through the tunnel and export readings
    Poll {
        /// Seconds between cycles
        #[arg(long)]
        interval: Option<u64>,
        /// Number of cycles to run (default 1)
        #[arg(long, conflicts_with = "forever")]
        cycles: Option<u32>,
        /// Poll until Ctrl-C
        #[arg(long)]
        forever: bool,
        /// Start cycles immediately instead of on interval boundaries
        #[arg(long)]
        no_align: bool,
    },
    /// Run the web dashboard
    Serve {
        /// Address to listen on (defaults to the configured bind address)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Show or initialise configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Print the JSON error document and exit 1
fn fail(error: &anyhow::Error, settings: Option<&Settings>) -> ! {
    let fallback;
    let settings = match settings {
        Some(settings) => settings,
        None => {
            fallback = Settings::with_base_dir(settings::resolve_base_dir(None).unwrap_or_default());
            &fallback
        }
    };
    let document = commands::error_document(error, settings);
    println!(
        "{}",
        serde_json::to_string_pretty(&document).unwrap_or_else(|_| document.to_string())
    );
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();

    let settings = match settings::load_settings(cli.base_dir.as_deref(), cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => fail(&e, None),
    };

    let guard = match prognoza::logging::init(&settings.app_log_dir(), cli.verbose) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("⚠ File logging disabled: {:#}", e);
            None
        }
    };

    if let Err(e) = commands::handle_command(&settings, cli.command) {
        tracing::error!("{:#}", e);
        drop(guard);
        fail(&e, Some(&settings));
    }
}
