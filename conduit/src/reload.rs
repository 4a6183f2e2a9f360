//! Configuration reloads on SIGHUP.

use std::{path::PathBuf, sync::Arc};

use llm::{FileSource, Gateway};

/// Reloads the configuration file every time the process receives SIGHUP.
///
/// A failed reload is logged and the running snapshot keeps serving.
#[cfg(unix)]
pub(crate) async fn on_hangup(gateway: Arc<Gateway>, path: PathBuf) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(e) => {
            log::error!("Failed to install SIGHUP handler, configuration reloads are disabled: {e}");
            return;
        }
    };

    let source = FileSource::new(path);

    while hangups.recv().await.is_some() {
        log::info!("Received SIGHUP, reloading configuration");

        match gateway.reload_from(&source) {
            Ok(version) => log::info!("Configuration reloaded, serving version {version}"),
            Err(e) => log::error!(
                "Configuration reload failed, keeping version {}: {e}",
                gateway.version()
            ),
        }
    }
}

#[cfg(not(unix))]
pub(crate) async fn on_hangup(_gateway: Arc<Gateway>, _path: PathBuf) {
    log::debug!("SIGHUP reloads are only available on Unix");
}
