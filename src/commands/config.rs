use anyhow::Result;
use prognoza::settings::{Settings, init_config_file};

#[derive(clap::Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default prognoza.toml into the base directory
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn handle_config(settings: &Settings, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            println!("# base_dir = {}", settings.base_dir.display());
            println!("# config file = {}", settings.config_file().display());
            println!();
            print!("{}", settings.to_toml()?);
        }
        ConfigCommands::Init { force } => {
            let path = init_config_file(settings, force)?;
            println!("✓ Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}
