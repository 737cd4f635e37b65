use opm_supervisor::config;
use opm_supervisor::context::SupervisorContext;
use std::sync::Arc;

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::new().filter_level(log::LevelFilter::Info).init();

    let base_dir = config::DEFAULT_BASE_DIR.clone();
    let config = config::read(&base_dir)?;
    log::info!("starting supervisor with base dir {}", base_dir.display());

    let context = Arc::new(SupervisorContext::new(&config)?);
    let rocket = opm_supervisor::http::build(Arc::clone(&context), &config.http.address, config.http.port);

    rocket.launch().await?;
    Ok(())
}
