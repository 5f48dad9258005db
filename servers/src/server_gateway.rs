use anyhow::{Context, Result};
use lib_gateway::configs::GatewayConfig;
use tokio::signal;

mod gateway_logic;
use gateway_logic::{config, downstream, logger, state};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), config.log_level())?;

    let core_config = match &config.core_config_path {
        Some(path) => GatewayConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    let seed = match &config.state_path {
        Some(path) => state::StateFile::load(path)?,
        None => state::StateFile::default(),
    };

    let app_state = state::AppState::new(&core_config, seed)?;
    app_state.start().await;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let mut downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for a shutdown signal, or for the server to die on its own
    let finished = tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
            None
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
            None
        }
        res = &mut downstream_handle => Some(res),
    };

    let _ = shutdown_tx.send(());
    app_state.stop();

    let result = match finished {
        Some(res) => res,
        None => downstream_handle.await,
    };
    match result {
        Ok(Err(e)) => log::error!("Downstream server failed: {}", e),
        Err(e) => log::error!("Downstream task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
