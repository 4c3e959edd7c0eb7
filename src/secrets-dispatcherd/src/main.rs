// SPDX-License-Identifier: Apache-2.0

//! The secrets-approval broker daemon: binds the local HTTP/WebSocket
//! boundary, and optionally the desktop notifier and Secret Service D-Bus
//! front-end, all driven by a single `sd-core::ApprovalManager`.

mod config;
mod credential;
mod logging;

use std::sync::Arc;

use clap::Parser;
use config::{Cli, Config};
use sd_core::ApprovalManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli)?;

    logging::init(&config.log_filter);

    let credential = credential::load_or_create(&config.credential_path())?;
    let signer_path = sd_gpgsign::locate_signer(&config.signer).map_err(|err| {
        tracing::warn!(error = %err, signer = %config.signer, "signer not found at startup");
        err
    });
    // A missing signer only matters once a `gpg_sign` request actually needs
    // it; don't refuse to start the whole broker over it.
    let signer_path = signer_path.unwrap_or_else(|_| std::path::PathBuf::from(&config.signer));

    let manager = ApprovalManager::new(config.manager.clone());

    if config.enable_notifier {
        match sd_notify::Notifier::connect(Arc::clone(&manager)).await {
            Ok(notifier) => {
                manager.subscribe(notifier);
            }
            Err(err) => {
                tracing::warn!(error = %err, "desktop notifier unavailable, continuing without it");
            }
        }
    }

    if config.enable_dbus_proxy {
        spawn_dbus_proxy(Arc::clone(&manager));
    }

    tracing::info!(socket = %config.socket_path.display(), "starting secrets-dispatcherd");
    sd_server::serve(&config.socket_path, manager, credential, signer_path).await?;
    Ok(())
}

/// The Secret Service D-Bus front-end runs on its own session-bus
/// connection and is best-effort: if the session bus is unreachable (e.g.
/// a headless CI container) the broker still serves the HTTP boundary.
fn spawn_dbus_proxy(manager: Arc<ApprovalManager>) {
    tokio::spawn(async move {
        let connection = match zbus::Connection::session().await {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(error = %err, "session bus unavailable, Secret Service proxy disabled");
                return;
            }
        };
        let backend = Arc::new(sd_dbus_proxy::NullBackend);
        let proxy = sd_dbus_proxy::SecretServiceProxy::new(manager, backend);
        if let Err(err) = sd_dbus_proxy::serve(&connection, proxy).await {
            tracing::error!(error = %err, "Secret Service proxy exited");
        }
    });
}
