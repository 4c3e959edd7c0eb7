// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sender::SenderInfo;

/// Unique identifier for a request. Wraps a v4 UUID rather than a bare
/// `String` so collisions are structurally ruled out, per spec's own
/// recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Allocate a fresh, random request id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The kind of sensitive operation a request is asking permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    GetSecret,
    Search,
    Write,
    Delete,
    GpgSign,
}

/// One keyring item a request touches: its path, a human-readable label,
/// and whatever attribute map the caller attached to it.
///
/// Empty for `search` and `gpg_sign` requests, which carry no items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub path: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ItemDescriptor {
    /// Extracts the keyring collection segment from this item's path: the
    /// path component immediately following `.../collection/` or
    /// `.../aliases/`. Returns the empty string if no such segment exists.
    pub fn collection(&self) -> String {
        collection_of(&self.path)
    }
}

/// Extracts the collection segment from a raw keyring item path.
///
/// `/org/freedesktop/secrets/collection/login/1` -> `"login"`
/// `/org/freedesktop/secrets/aliases/default`    -> `"default"`
/// anything else                                 -> `""`
pub fn collection_of(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for marker in ["collection", "aliases"] {
        if let Some(pos) = segments.iter().position(|s| *s == marker) {
            if let Some(next) = segments.get(pos + 1) {
                return (*next).to_string();
            }
        }
    }
    String::new()
}

/// Fields specific to a `gpg_sign` request: everything the signing pipeline
/// needs to invoke a signer and everything downstream needs to render what
/// it is signing.
#[derive(Clone, Serialize, Deserialize)]
pub struct GpgSignInfo {
    pub repo_name: String,
    pub commit_msg: String,
    pub author: String,
    pub committer: String,
    pub key_id: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub parent_hash: Option<String>,
    /// Raw commit-object bytes. Opaque to the manager; fed verbatim to the
    /// signer's stdin. Base64-encoded on the wire.
    #[serde(with = "base64_bytes")]
    pub commit_object: Vec<u8>,
}

impl fmt::Debug for GpgSignInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpgSignInfo")
            .field("repo_name", &self.repo_name)
            .field("author", &self.author)
            .field("committer", &self.committer)
            .field("key_id", &self.key_id)
            .field("fingerprint", &self.fingerprint)
            .field("changed_files", &self.changed_files)
            .field("parent_hash", &self.parent_hash)
            .field("commit_object_len", &self.commit_object.len())
            .finish()
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// An in-flight or just-resolved request.
///
/// `Request` is immutable once constructed: the manager never mutates a
/// `Request` in place, it only removes one kind of handle to it (the
/// pending-table entry) and emits events carrying snapshots. This makes it
/// safe to clone a `Request` into an event or history entry without a lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub request_type: RequestType,
    pub client: String,
    #[serde(default)]
    pub items: Vec<ItemDescriptor>,
    #[serde(default)]
    pub search_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub gpg_sign_info: Option<GpgSignInfo>,
    pub session: String,
    #[serde(default)]
    pub sender: SenderInfo,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A read-only snapshot of a pending request, as returned by `List()` and
/// broadcast in `snapshot`/`request_created` boundary messages.
///
/// Distinct type from `Request` only in name: the manager never exposes
/// the completion primitive (a `tokio::sync::oneshot::Sender`, living in
/// `sd-core`, not here) to observers or adapters, so a `Request` is already
/// safe to hand out directly once it is attached to a pending entry.
pub type PendingRequest = Request;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_of_extracts_segment_after_collection_marker() {
        assert_eq!(
            collection_of("/org/freedesktop/secrets/collection/login/1"),
            "login"
        );
    }

    #[test]
    fn collection_of_extracts_segment_after_aliases_marker() {
        assert_eq!(
            collection_of("/org/freedesktop/secrets/aliases/default"),
            "default"
        );
    }

    #[test]
    fn collection_of_is_empty_for_unrelated_path() {
        assert_eq!(collection_of("/org/freedesktop/secrets/prompt/1"), "");
    }

    #[test]
    fn gpg_sign_info_debug_never_prints_commit_object_bytes() {
        let info = GpgSignInfo {
            repo_name: "repo".into(),
            commit_msg: "msg".into(),
            author: "a".into(),
            committer: "c".into(),
            key_id: "ABCDEF".into(),
            fingerprint: None,
            changed_files: Vec::new(),
            parent_hash: None,
            commit_object: b"tree deadbeef\nsecret bytes".to_vec(),
        };
        let rendered = format!("{info:?}");
        assert!(!rendered.contains("secret bytes"));
        assert!(rendered.contains("commit_object_len"));
    }
}
