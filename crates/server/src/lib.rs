//! Conduit server library.
//!
//! Provides a reusable server function to serve Conduit either for the binary, or for the integration tests.

#![deny(missing_docs)]

mod auth;
mod health;
mod rate_limit;

use std::{net::SocketAddr, sync::Arc};

use anyhow::anyhow;
use auth::AuthLayer;
use axum::{Router, routing::get};
use axum_server::tls_rustls::RustlsConfig;
use config::Config;
use llm::Gateway;
use rate_limit::RateLimitLayer;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Configuration for serving Conduit.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to
    pub listen_address: SocketAddr,
    /// The deserialized Conduit TOML configuration.
    pub config: Config,
    /// The pipeline. Shared with whoever triggers reloads.
    pub gateway: Arc<Gateway>,
    /// Cancelled to stop accepting connections and drain in-flight requests.
    pub shutdown: CancellationToken,
}

/// Builds the application router.
///
/// Layers run outside in: authentication attaches the request context, then the rate limiter
/// charges the credential, then the pipeline handles the request.
pub fn app(gateway: Arc<Gateway>, config: &Config) -> Router {
    let mut app = llm::router(gateway.clone())
        .layer(RateLimitLayer::new(gateway.clone()))
        .layer(AuthLayer::new(gateway.clone()));

    // Added after the layers, so health checks need no key and are never rate limited.
    if config.server.health.enabled {
        let health = Router::new()
            .route(&config.server.health.path, get(health::health))
            .with_state(gateway);

        app = app.merge(health);
    }

    app
}

/// Starts and runs the Conduit server with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        gateway,
        shutdown,
    }: ServeConfig,
) -> anyhow::Result<()> {
    let app = app(gateway, &config);

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    match &config.server.tls {
        Some(tls_config) => {
            let rustls_config = RustlsConfig::from_pem_file(&tls_config.certificate, &tls_config.key)
                .await
                .map_err(|e| anyhow!("Failed to load TLS certificate and key: {e}"))?;

            log::info!("Conduit listening at: https://{listen_address}");

            let handle = axum_server::Handle::new();

            tokio::spawn({
                let handle = handle.clone();

                async move {
                    shutdown.cancelled().await;
                    handle.graceful_shutdown(None);
                }
            });

            axum_server::from_tcp_rustls(listener.into_std()?, rustls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .map_err(|e| anyhow!("Failed to start HTTPS server: {e}"))?;
        }
        None => {
            log::info!("Conduit listening at: http://{listen_address}");

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .map_err(|e| anyhow!("Failed to start HTTP server: {}", e))?;
        }
    }

    log::info!("Server stopped");

    Ok(())
}
