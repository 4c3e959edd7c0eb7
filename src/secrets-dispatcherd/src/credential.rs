// SPDX-License-Identifier: Apache-2.0

//! The bearer credential clients authenticate with (spec §4.7 / §6):
//! a 64 hex-character string, generated once and persisted at
//! `<state_dir>/.cookie` with `0600` permissions, analogous to an X11
//! `.Xauthority` cookie.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rand::RngCore;

/// Reads the credential at `path`, generating and persisting a fresh one
/// if it doesn't exist yet. Returns the credential as its raw ASCII-hex
/// bytes, which is what [`sd_server`]'s constant-time comparison expects.
pub fn load_or_create(path: &Path) -> anyhow::Result<Vec<u8>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            if trimmed.len() != 64 || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
                anyhow::bail!(
                    "credential file {} does not contain a 64 hex-character cookie",
                    path.display()
                );
            }
            Ok(trimmed.as_bytes().to_vec())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let credential = generate();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &credential)?;
            std::fs::set_permissions(path, Permissions::from_mode(0o600))?;
            Ok(credential.into_bytes())
        }
        Err(err) => Err(err.into()),
    }
}

fn generate() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_a_64_char_hex_cookie_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".cookie");
        let credential = load_or_create(&path).unwrap();
        assert_eq!(credential.len(), 64);
        assert!(credential.iter().all(|b| b.is_ascii_hexdigit()));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn reloads_the_same_cookie_on_a_second_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".cookie");
        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_a_malformed_existing_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".cookie");
        std::fs::write(&path, "not-hex").unwrap();
        assert!(load_or_create(&path).is_err());
    }
}
