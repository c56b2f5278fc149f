use tokio_util::sync::CancellationToken;

use voicehub::service::hub::CallDb;
use voicehub::service::pipeline::{self, Backends};
use voicehub::shared::{config, logging};

/// Runs the VIO, every pipeline stage and the Hub in one process until Ctrl-C, a fatal
/// stage error, or `HUB_NCALLS` finished calls.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cfg = config::Config::from_env()?;
    if let Err(e) = CallDb::new(&cfg.hub).log_all() {
        log::warn!("[calldb] cannot read {}: {}", cfg.hub.call_db.display(), e);
    }

    let close = CancellationToken::new();
    let on_signal = close.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::warn!("[main] shutdown signal error: {:?}", err);
        }
        log::info!("[main] shutting down");
        on_signal.cancel();
    });

    let backends = Backends::from_config(&cfg);
    let result = pipeline::run(cfg, backends, close).await;
    if let Err(e) = &result {
        log::error!("[main] voicehub stopped: {:#}", e);
    }
    result
}
