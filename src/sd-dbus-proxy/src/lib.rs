// SPDX-License-Identifier: Apache-2.0

//! `org.freedesktop.Secret.Service` front-end, per spec §4.7 / SPEC_FULL.md
//! §4.7: a `zbus` service skeleton exposing the approval-gated subset of
//! the Secret Service surface this broker must intercept — `GetSecret`,
//! `SearchItems`, `CreateItem`, `Delete` — each gated on
//! `ApprovalManager::require_approval` before delegating to a [`Backend`].
//!
//! Collections management and prompt objects beyond the approval prompt
//! are out of scope (spec.md §1) and are not implemented.

pub mod backend;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub use backend::{Backend, BackendError, NullBackend};
use sd_core::ApprovalManager;
use sd_types::{ItemDescriptor, RequestType, SenderInfo};
use tokio_util::sync::CancellationToken;
use zbus::interface;

pub const SERVICE_NAME: &str = "org.freedesktop.secrets";
pub const OBJECT_PATH: &str = "/org/freedesktop/secrets";

/// The exported D-Bus object. Every method call resolves its caller's bus
/// unique name from the message header, asks the manager for approval
/// using it as [`SenderInfo::unique_name`], and only on success forwards
/// to the configured [`Backend`].
pub struct SecretServiceProxy {
    manager: Arc<ApprovalManager>,
    backend: Arc<dyn Backend>,
}

impl SecretServiceProxy {
    pub fn new(manager: Arc<ApprovalManager>, backend: Arc<dyn Backend>) -> Self {
        Self { manager, backend }
    }

    async fn require_approval(
        &self,
        client: String,
        request_type: RequestType,
        items: Vec<ItemDescriptor>,
        search_attributes: BTreeMap<String, String>,
        sender: SenderInfo,
    ) -> Result<(), sd_types::Error> {
        // Each call gets its own cancellation token: the D-Bus caller has
        // no way to cancel mid-call short of dropping the connection, and
        // a dropped connection simply leaves this future unpolled.
        let cancel = CancellationToken::new();
        self.manager
            .require_approval(cancel, client, items, "dbus".into(), request_type, search_attributes, sender)
            .await
    }
}

fn sender_info(header: &zbus::message::Header<'_>) -> SenderInfo {
    SenderInfo {
        unique_name: header
            .sender()
            .map(|name| name.to_string())
            .unwrap_or_default(),
        ..SenderInfo::empty()
    }
}

fn client_label(sender: &SenderInfo) -> String {
    if sender.unique_name.is_empty() {
        "dbus-client".to_string()
    } else {
        sender.unique_name.clone()
    }
}

#[interface(name = "org.freedesktop.Secret.Service")]
impl SecretServiceProxy {
    async fn get_secret(
        &self,
        item_path: String,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> zbus::fdo::Result<Vec<u8>> {
        let sender = sender_info(&header);
        let item = ItemDescriptor {
            path: item_path.clone(),
            label: String::new(),
            attributes: BTreeMap::new(),
        };
        self.require_approval(
            client_label(&sender),
            RequestType::GetSecret,
            vec![item],
            BTreeMap::new(),
            sender,
        )
        .await
        .map_err(approval_to_fdo)?;

        self.backend
            .get_secret(&item_path)
            .await
            .map_err(backend_to_fdo)
    }

    async fn search_items(
        &self,
        attributes: HashMap<String, String>,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> zbus::fdo::Result<Vec<String>> {
        let sender = sender_info(&header);
        let attrs: BTreeMap<String, String> = attributes.into_iter().collect();
        self.require_approval(
            client_label(&sender),
            RequestType::Search,
            Vec::new(),
            attrs.clone(),
            sender,
        )
        .await
        .map_err(approval_to_fdo)?;

        self.backend
            .search_items(&attrs)
            .await
            .map_err(backend_to_fdo)
    }

    async fn create_item(
        &self,
        collection_path: String,
        label: String,
        attributes: HashMap<String, String>,
        secret: Vec<u8>,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> zbus::fdo::Result<String> {
        let sender = sender_info(&header);
        let attrs: BTreeMap<String, String> = attributes.into_iter().collect();
        let item = ItemDescriptor {
            path: collection_path.clone(),
            label: label.clone(),
            attributes: attrs.clone(),
        };
        self.require_approval(
            client_label(&sender),
            RequestType::Write,
            vec![item],
            BTreeMap::new(),
            sender,
        )
        .await
        .map_err(approval_to_fdo)?;

        self.backend
            .create_item(&collection_path, &label, &attrs, &secret)
            .await
            .map_err(backend_to_fdo)
    }

    async fn delete(
        &self,
        item_path: String,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> zbus::fdo::Result<()> {
        let sender = sender_info(&header);
        let item = ItemDescriptor {
            path: item_path.clone(),
            label: String::new(),
            attributes: BTreeMap::new(),
        };
        self.require_approval(
            client_label(&sender),
            RequestType::Delete,
            vec![item],
            BTreeMap::new(),
            sender,
        )
        .await
        .map_err(approval_to_fdo)?;

        self.backend.delete(&item_path).await.map_err(backend_to_fdo)
    }
}

fn approval_to_fdo(err: sd_types::Error) -> zbus::fdo::Error {
    zbus::fdo::Error::AccessDenied(err.to_string())
}

fn backend_to_fdo(err: BackendError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

/// Claims [`SERVICE_NAME`] on `connection` and serves `proxy` at
/// [`OBJECT_PATH`] until the connection is dropped.
pub async fn serve(
    connection: &zbus::Connection,
    proxy: SecretServiceProxy,
) -> zbus::Result<()> {
    connection.object_server().at(OBJECT_PATH, proxy).await?;
    connection.request_name(SERVICE_NAME).await?;
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use sd_core::ManagerConfig;

    use super::*;

    fn proxy_with_null_backend() -> SecretServiceProxy {
        let manager = ApprovalManager::new(ManagerConfig::default());
        SecretServiceProxy::new(manager, Arc::new(NullBackend))
    }

    #[test]
    fn client_label_falls_back_when_sender_unknown() {
        let sender = SenderInfo::empty();
        assert_eq!(client_label(&sender), "dbus-client");
    }

    #[tokio::test]
    async fn null_backend_rejects_every_call_after_approval() {
        let proxy = proxy_with_null_backend();
        let err = proxy
            .backend
            .get_secret("/org/freedesktop/secrets/collection/login/1")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unconfigured));
    }
}
