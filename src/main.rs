use overchan_nntpd::{load_feeds, Config, Daemon, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "srnd.ini".to_string());
    let feeds_path = args.next().unwrap_or_else(|| "feeds.ini".to_string());

    let config = Config::load(&config_path)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let feeds = load_feeds(&feeds_path)?;
    let mut daemon = Daemon::new(config, feeds)?;
    daemon.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    daemon.end().await;
    Ok(())
}
