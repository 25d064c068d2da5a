/*!
 * LABWATCH HUB - Point d'entrée
 *
 * RÔLE : charge `.env` + config YAML, installe les logs, démarre le hub puis
 * attend un signal (ou POST /shutdown) pour drainer et sortir.
 */

use anyhow::Context;
use labwatch_hub::config::load_config;
use labwatch_hub::logging::init_logging;
use labwatch_hub::{Hub, HubOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = load_config().await.context("loading hub configuration")?;
    let logging = init_logging(&config.logging).context("initializing logging")?;
    tracing::info!("[hub] run log in {}", logging.run_dir().display());

    let options = HubOptions {
        api_key: std::env::var("LABWATCH_API_KEY").ok(),
        ..Default::default()
    };
    let hub = Hub::start(config, options, Some(logging))
        .await
        .context("starting hub")?;

    let code = hub.run_until_shutdown().await;
    std::process::exit(code);
}
