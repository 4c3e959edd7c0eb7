// SPDX-License-Identifier: Apache-2.0

//! The real keyring backend this proxy delegates to once a call clears
//! approval. Out of scope per spec §1 ("D-Bus protocol front-end... only
//! the call it makes into the manager matters here") — this module is the
//! seam a concrete backend (gnome-keyring, kwallet) plugs into, not a full
//! Secret Service client.

use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("upstream keyring call failed: {0}")]
    Upstream(#[source] zbus::Error),
    #[error("no backend configured for this operation")]
    Unconfigured,
}

/// The approval-gated subset of the Secret Service surface this broker
/// intercepts: `GetSecret`, `SearchItems`, `CreateItem`, `Delete`.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn get_secret(&self, item_path: &str) -> Result<Vec<u8>, BackendError>;

    async fn search_items(
        &self,
        attributes: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, BackendError>;

    async fn create_item(
        &self,
        collection_path: &str,
        label: &str,
        attributes: &BTreeMap<String, String>,
        secret: &[u8],
    ) -> Result<String, BackendError>;

    async fn delete(&self, item_path: &str) -> Result<(), BackendError>;
}

/// A backend that has nothing behind it. Useful for standing up the proxy
/// (and for tests) before a real keyring is wired in; every call fails
/// with [`BackendError::Unconfigured`] — approval still ran, so callers
/// can tell "denied" from "nothing to delegate to".
#[derive(Debug, Default)]
pub struct NullBackend;

#[async_trait::async_trait]
impl Backend for NullBackend {
    async fn get_secret(&self, _item_path: &str) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::Unconfigured)
    }

    async fn search_items(
        &self,
        _attributes: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, BackendError> {
        Err(BackendError::Unconfigured)
    }

    async fn create_item(
        &self,
        _collection_path: &str,
        _label: &str,
        _attributes: &BTreeMap<String, String>,
        _secret: &[u8],
    ) -> Result<String, BackendError> {
        Err(BackendError::Unconfigured)
    }

    async fn delete(&self, _item_path: &str) -> Result<(), BackendError> {
        Err(BackendError::Unconfigured)
    }
}
