// SPDX-License-Identifier: Apache-2.0

//! Daemon-side half of the GPG signing pipeline: locate a real signer
//! binary and invoke it for an approved `gpg_sign` request, per spec §4.5.
//!
//! Nothing here talks to the approval manager — callers resolve an
//! approval first (via `sd-core::ApprovalManager`), then call [`sign`] and
//! feed the result back through `ApproveWithSignature`/`ApproveGPGFailed`.

use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use sd_types::GpgSignInfo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Fd number the signer is told to write its status protocol to. Chosen
/// arbitrarily above stderr; dup'd onto this number in the child between
/// fork and exec.
const STATUS_FD: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("no usable `{0}` binary found on PATH")]
    SignerNotFound(String),
    #[error("failed to create status pipe: {0}")]
    Pipe(#[source] std::io::Error),
    #[error("failed to spawn signer: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to write commit object to signer stdin: {0}")]
    WriteStdin(#[source] std::io::Error),
    #[error("failed to read signer output: {0}")]
    ReadOutput(#[source] std::io::Error),
}

/// Result of invoking the signer. `signature` and `gpg_status` are always
/// captured in separate buffers — mixing them would corrupt the signature
/// (spec §4.5 "side-channel invariant").
#[derive(Debug, Clone)]
pub struct SignOutcome {
    pub signature: Vec<u8>,
    pub gpg_status: Vec<u8>,
    pub exit_code: i32,
}

impl SignOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Finds a real `signer_name` binary on `$PATH`, skipping any candidate
/// that is the same file (by device + inode, not path) as the running
/// executable.
///
/// Design note "self-recursion guard": prevents the daemon from invoking
/// itself if it is ever (mis)configured as its own signer.
pub fn locate_signer(signer_name: &str) -> Result<PathBuf, SignError> {
    let self_meta = std::env::current_exe().and_then(std::fs::metadata).ok();
    which::which_all(signer_name)
        .map_err(|_| SignError::SignerNotFound(signer_name.to_string()))?
        .find(|candidate| match (&self_meta, std::fs::metadata(candidate)) {
            (Some(self_meta), Ok(meta)) => !same_file(self_meta, &meta),
            _ => true,
        })
        .ok_or_else(|| SignError::SignerNotFound(signer_name.to_string()))
}

fn same_file(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

/// Invokes `signer_path` for an approved `gpg_sign` request.
///
/// Feeds `info.commit_object` to the signer's stdin, captures the
/// detached signature on stdout and the GPG status protocol on a
/// dedicated status-fd. Never returns `Err` for a nonzero signer exit —
/// that is a normal [`SignOutcome`] with `exit_code != 0`; `Err` is
/// reserved for failing to even run the signer.
pub async fn sign(signer_path: &Path, info: &GpgSignInfo) -> Result<SignOutcome, SignError> {
    let (mut status_reader, status_writer) = os_pipe::pipe().map_err(SignError::Pipe)?;
    let status_fd = status_writer.as_raw_fd();

    let mut command = Command::new(signer_path);
    command
        .arg("--status-fd")
        .arg(STATUS_FD.to_string())
        .arg("--detach-sign")
        .arg("--local-user")
        .arg(&info.key_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    // Safety: only async-signal-safe calls (dup2) run in the child between
    // fork and exec, as required by `pre_exec`'s contract.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(status_fd, STATUS_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(SignError::Spawn)?;
    // Drop our copy of the write end; the child keeps its own dup'd fd 3
    // open, so the reader only sees EOF once the child itself exits.
    drop(status_writer);

    let mut stdin = child.stdin.take().expect("stdin was piped");
    let mut stdout = child.stdout.take().expect("stdout was piped");
    let commit_object = info.commit_object.clone();

    let write_task = tokio::spawn(async move {
        stdin.write_all(&commit_object).await?;
        stdin.shutdown().await
    });
    let status_task = tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        status_reader.read_to_end(&mut buf)?;
        Ok::<_, std::io::Error>(buf)
    });

    let mut signature = Vec::new();
    stdout
        .read_to_end(&mut signature)
        .await
        .map_err(SignError::ReadOutput)?;

    write_task
        .await
        .expect("stdin-writer task panicked")
        .map_err(SignError::WriteStdin)?;
    let gpg_status = status_task
        .await
        .expect("status-reader task panicked")
        .map_err(SignError::ReadOutput)?;

    let status = child.wait().await.map_err(SignError::Spawn)?;
    Ok(SignOutcome {
        signature,
        gpg_status,
        exit_code: status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_file_compares_device_and_inode_not_path() {
        let exe = std::env::current_exe().unwrap();
        let meta = std::fs::metadata(&exe).unwrap();
        assert!(same_file(&meta, &meta));
    }

    #[tokio::test]
    async fn sign_with_missing_binary_surfaces_spawn_error() {
        let err = sign(
            Path::new("/nonexistent/not-a-real-signer"),
            &GpgSignInfo {
                repo_name: "repo".into(),
                commit_msg: "msg".into(),
                author: "a".into(),
                committer: "c".into(),
                key_id: "ABCDEF".into(),
                fingerprint: None,
                changed_files: Vec::new(),
                parent_hash: None,
                commit_object: b"tree deadbeef\n".to_vec(),
            },
        )
        .await;
        assert!(matches!(err, Err(SignError::Spawn(_))));
    }
}
