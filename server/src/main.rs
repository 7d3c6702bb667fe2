use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tunnel_server::config::Config;
use tunnel_server::provisioner::{CloudflaredProvisioner, PublicEndpoint, StaticEndpoint};
use tunnel_server::registry::SessionRegistry;
use tunnel_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_server=info".into()),
        )
        .init();

    let config = Arc::new(Config::parse());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let endpoint: Arc<dyn PublicEndpoint> = match &config.public_base {
        Some(base) => {
            info!(base = %base, "using fixed public base URL");
            Arc::new(StaticEndpoint::new(base.clone()))
        }
        None => {
            let origin = format!("http://localhost:{}", config.listen.port());
            let provisioner = Arc::new(
                CloudflaredProvisioner::new(config.cloudflared_bin.clone(), origin)
                    .context("invalid quick tunnel URL pattern")?,
            );
            provisioner.spawn(shutdown_rx);
            provisioner
        }
    };

    let registry = Arc::new(SessionRegistry::new(
        endpoint,
        config.share_prefix.clone(),
        config.session_settings(),
    ));
    let app = tunnel_server::router(AppState::new(Arc::clone(&registry), Arc::clone(&config)));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("🚇 Tunnel Server listening on {}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            // Open sessions keep their connections busy; close them so
            // graceful shutdown can finish.
            registry.shutdown();
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
