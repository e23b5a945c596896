//! gustd — the gust peer-to-peer daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use gust_catalogue::Catalogue;
use gust_core::config::GustConfig;

use gustd::{control, server::Server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = GustConfig::load().context("failed to load configuration")?;
    tracing::info!(
        catalogue_dir = %config.catalogue_dir.display(),
        downloads_dir = %config.downloads_dir.display(),
        udp_port = config.udp_port,
        control_socket = %config.control_socket.display(),
        "gustd starting"
    );

    // claiming the index is fatal if another live daemon owns it
    let catalogue = Arc::new(
        Catalogue::init(&config.catalogue_dir, config.downloads_dir.clone())
            .context("failed to claim the catalogue")?,
    );

    let server = Server::bind(config.udp_port, Arc::clone(&catalogue))
        .context("failed to bind the message server")?;

    // keep the index ownership stamp fresh, well under the takeover window
    let touch_task = {
        let catalogue = Arc::clone(&catalogue);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                if let Err(e) = catalogue.touch().await {
                    tracing::warn!(error = %e, "failed to refresh index stamp");
                }
            }
        })
    };

    let server_task = tokio::spawn(Arc::clone(&server).run());

    let control_task = {
        let server = Arc::clone(&server);
        let socket_path = config.control_socket.clone();
        tokio::spawn(async move { control::serve(&socket_path, server).await })
    };

    tokio::select! {
        r = server_task => tracing::error!("message server exited: {:?}", r),
        r = control_task => tracing::error!("control plane exited: {:?}", r),
        r = touch_task => tracing::error!("index touch task exited: {:?}", r),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            server.cancel_uploads();
        }
    }

    let _ = std::fs::remove_file(&config.control_socket);
    Ok(())
}
