use super::print_json;
use anyhow::Result;
use prognoza::settings::Settings;
use prognoza::umg::{CsvExporter, Meter, UmgClient};

#[derive(clap::Subcommand, Clone)]
pub enum UmgCommands {
    /// Probe the UMG HTTP and Modbus ports
    Health,
    /// Read the configured registers once
    Read {
        /// Append the reading to today's CSV export
        #[arg(long)]
        export: bool,
    },
}

pub fn handle_umg(settings: &Settings, command: UmgCommands) -> Result<()> {
    let client = UmgClient::from_settings(&settings.umg);
    match command {
        UmgCommands::Health => print_json(&client.health())?,
        UmgCommands::Read { export } => {
            let reading = client.read();
            if export {
                let path = CsvExporter::new(settings.exports_dir()).export(&reading)?;
                print_json(&serde_json::json!({
                    "data": reading,
                    "csv_path": path,
                }))?;
            } else {
                print_json(&reading)?;
            }
        }
    }
    Ok(())
}
