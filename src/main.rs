//! livehub server binary
//!
//! Loads the TOML config named on the command line (or defaults), starts
//! the enabled listeners, and runs until interrupted. A listener that fails
//! to bind is fatal with a non-zero exit; a signal-initiated shutdown
//! exits 0.

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use livehub::broker::RoomRegistry;
use livehub::config::Config;
use livehub::server::RtmpServer;
use livehub::{hls, httpflv, rtp};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("livehub: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.tracing_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = Arc::new(RoomRegistry::new(&config));

    // Shutdown fan-out: ctrl-c stops every listener
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });
    let wait = |mut rx: tokio::sync::watch::Receiver<bool>| async move {
        let _ = rx.changed().await;
    };

    // RTP sessions publish into the broker before the listeners come up
    if config.rtp.enable {
        if let Err(e) = rtp::start(&config.rtp, &registry).await {
            tracing::error!(error = %e, "RTP startup failed");
            return ExitCode::FAILURE;
        }
    }

    let rtmp_server = RtmpServer::new(config.rtmp.clone(), Arc::clone(&registry) as _);
    let rtmp_task = rtmp_server.run_until(wait(shutdown_rx.clone()));

    let flv_task = {
        let config = config.http_flv.clone();
        let observer: Arc<dyn livehub::broker::StreamObserver> = Arc::clone(&registry) as _;
        let shutdown = wait(shutdown_rx.clone());
        async move {
            if config.enable {
                httpflv::serve(config, observer, shutdown).await
            } else {
                shutdown.await;
                Ok(())
            }
        }
    };

    let hls_task = {
        let config = config.hls.clone();
        let shutdown = wait(shutdown_rx.clone());
        async move {
            if config.enable {
                hls::serve(config, shutdown).await
            } else {
                shutdown.await;
                Ok(())
            }
        }
    };

    match tokio::try_join!(rtmp_task, flv_task, hls_task) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> livehub::Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::load(path),
        None => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
