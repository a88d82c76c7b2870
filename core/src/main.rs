use clap::Parser;
use lanshare::config::CliConfig;
use lanshare::Engine;
use models::AppConfig;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg: AppConfig = CliConfig::parse().into_app_config();

    let engine = Engine::new(cfg)?;
    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    engine.stop();
    Ok(())
}
