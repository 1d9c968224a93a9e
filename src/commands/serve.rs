use anyhow::Result;
use prognoza::settings::Settings;
use prognoza::web::{self, AppState};

pub fn handle_serve(settings: &Settings, bind: Option<&str>) -> Result<()> {
    let bind = bind.unwrap_or(&settings.dashboard.bind).to_string();
    let state = AppState::from_settings(settings);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(web::start_server(&bind, state))
}
