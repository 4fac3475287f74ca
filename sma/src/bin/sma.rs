#[macro_use]
extern crate tracing;

use std::sync::Arc;

use clap::Parser;
use sma::{
    agent::Agent,
    config::{Config, SmaCliArgs},
    crypto::{build_engine, CryptoRegistry},
    device::init_managers,
    grpc::SmaGrpcServer,
    logger,
    spdk::Spdk,
    volume::VolumeManager,
};
use tokio::signal::unix::{signal, SignalKind};

/// Completes when INT or TERM is received.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sig_int.recv() => {
            warn!(signal = ?SignalKind::interrupt(), "Signalled");
        },
        _ = sig_term.recv() => {
            warn!(signal = ?SignalKind::terminate(), "Signalled");
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = SmaCliArgs::parse();
    logger::init(&args.log_level, args.log_format)?;

    let config = Config::load(&args)?;
    info!("Starting storage management agent: {:?}", config);

    let client =
        jsonrpc::Client::new(config.socket.as_str(), jsonrpc::DEFAULT_TIMEOUT);
    let spdk = Spdk::new(Arc::new(client));

    let crypto = Arc::new(CryptoRegistry::new());
    if let Some(engine) = &config.crypto {
        let driver = engine.params.driver.as_deref();
        crypto.register(build_engine(&engine.name, driver, &spdk)?);
        crypto.set_crypto_engine(&engine.name)?;
    }

    let devices = init_managers(&config.devices, &spdk, &crypto).await?;
    if devices.is_empty() {
        warn!("No device managers configured");
    }

    let volumes = Arc::new(VolumeManager::new(
        spdk,
        crypto,
        config.discovery_timeout()?,
        config.cleanup_period()?,
    ));
    volumes.start()?;

    let agent = Arc::new(Agent::new(volumes.clone(), devices));
    let endpoint = config.listen_address()?;
    let shutdown = async {
        if let Err(error) = shutdown_signal().await {
            error!("Failed to register signal handlers: {}", error);
            std::future::pending::<()>().await;
        }
    };
    let result = SmaGrpcServer::run(endpoint, agent, shutdown).await;

    volumes.stop().await;
    info!("Storage management agent stopped");
    result.map_err(Into::into)
}
