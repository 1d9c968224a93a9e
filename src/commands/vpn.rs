use super::print_json;
use anyhow::Result;
use prognoza::settings::Settings;
use prognoza::vpn::resolve::resolve_config_path;
use prognoza::vpn::{VpnConnection, extract_assets, vpn_status};
use std::path::PathBuf;

#[derive(clap::Subcommand, Clone)]
pub enum VpnCommands {
    /// Clean the profile, bring the tunnel up and check the UMG
    Connect {
        /// OpenVPN profile (defaults to the configured profile)
        #[arg(long)]
        ovpn: Option<PathBuf>,
    },
    /// Tear the tunnel down
    Disconnect {
        #[arg(long)]
        ovpn: Option<PathBuf>,
    },
    /// Report tunnel status as JSON
    Status {
        #[arg(long)]
        ovpn: Option<PathBuf>,
    },
    /// Extract inline certificates and write the clean profile
    Extract {
        #[arg(long)]
        ovpn: Option<PathBuf>,
        /// Output directory (defaults to secrets/ovpn_assets)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

pub fn handle_vpn(settings: &Settings, command: VpnCommands) -> Result<()> {
    match command {
        VpnCommands::Connect { ovpn } => {
            let connection = VpnConnection::from_settings(settings);
            let status = connection.connect(ovpn.as_deref());
            print_json(&status)?;
        }
        VpnCommands::Disconnect { ovpn } => {
            let connection = VpnConnection::from_settings(settings);
            connection.disconnect()?;
            print_json(&connection.status_for(ovpn.as_deref()))?;
        }
        VpnCommands::Status { ovpn } => {
            let path = ovpn.unwrap_or_else(|| settings.default_ovpn_path());
            print_json(&vpn_status(settings, &path))?;
        }
        VpnCommands::Extract { ovpn, out } => {
            let requested = ovpn.unwrap_or_else(|| settings.default_ovpn_path());
            let resolved =
                resolve_config_path(&requested, &settings.base_dir, &settings.secrets_dir())?;
            if let Some(note) = &resolved.note {
                eprintln!("⚠ {}", note);
            }
            let out = out.unwrap_or_else(|| settings.assets_dir());
            let report = extract_assets(
                &resolved.path,
                &out,
                &settings.vpn.profile_name,
                &settings.umg.host,
            )?;
            print_json(&report)?;
        }
    }
    Ok(())
}
