// SPDX-License-Identifier: Apache-2.0

//! Turns an accepted local connection into a [`SenderInfo`]: peer pid/uid via
//! `SO_PEERCRED`, the ancestor process chain via `/proc`, and the "invoker"
//! heuristic that picks the user-facing process out of that chain.
//!
//! Every step here is best-effort. If credential resolution fails at any
//! point the caller gets [`SenderInfo::empty`] rather than an error — per
//! spec §4.6, the request still proceeds, just without invoker context (and
//! therefore ineligible for auto-approve matching).

use std::fs;
use std::path::PathBuf;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use sd_types::SenderInfo;
use tokio::net::UnixStream;

/// Shells skipped by the invoker heuristic. A shell is never itself the
/// "invoker" — it is the thing the invoker used to launch the intermediate
/// tool, so treating it as the invoker would misattribute every rule keyed
/// on `unit_name`.
const KNOWN_SHELLS: &[&str] = &["sh", "bash", "zsh", "fish", "dash", "csh", "tcsh", "ksh"];

/// Resolves `stream`'s peer into a [`SenderInfo`].
///
/// The cheap half (the `SO_PEERCRED` syscall) runs inline; the `/proc` walk
/// is blocking filesystem I/O and is offloaded to a blocking thread so the
/// reactor is never stalled by it.
pub async fn resolve(stream: &UnixStream) -> SenderInfo {
    let Some((pid, uid)) = peer_credentials(stream) else {
        return SenderInfo::empty();
    };
    resolve_from_pid_uid(pid, uid).await
}

/// Resolves a `SenderInfo` from an already-known peer pid/uid pair.
///
/// Split out from [`resolve`] so a boundary adapter that only gets to look
/// at `SO_PEERCRED` once per accepted connection (e.g. `sd-server`'s Unix
/// socket listener, which resolves the syscall-cheap half synchronously at
/// accept time and defers the `/proc` walk to the first request that needs
/// it) can still reach the invoker heuristic without holding onto the
/// `UnixStream` itself.
pub async fn resolve_from_pid_uid(pid: u32, uid: u32) -> SenderInfo {
    tokio::task::spawn_blocking(move || resolve_blocking(pid, uid))
        .await
        .unwrap_or_else(|join_err| {
            tracing::warn!(error = %join_err, "peer credential resolution task panicked");
            SenderInfo::empty()
        })
}

/// Reads `stream`'s `SO_PEERCRED` pid/uid pair without the `/proc` walk.
/// Exposed so a caller holding the stream only at accept time (before
/// handing it off to an HTTP server) can stash the cheap half and resolve
/// the rest later via [`resolve_from_pid_uid`].
pub fn peer_pid_uid(stream: &UnixStream) -> Option<(u32, u32)> {
    peer_credentials(stream)
}

fn peer_credentials(stream: &UnixStream) -> Option<(u32, u32)> {
    match getsockopt(stream, PeerCredentials) {
        Ok(creds) => Some((creds.pid() as u32, creds.uid())),
        Err(err) => {
            tracing::debug!(error = %err, "SO_PEERCRED lookup failed");
            None
        }
    }
}

fn resolve_blocking(pid: u32, uid: u32) -> SenderInfo {
    let chain_peer_first = process_chain(pid);
    if chain_peer_first.is_empty() {
        return SenderInfo {
            pid: Some(pid),
            uid: Some(uid),
            exe_path: exe_path_of(pid),
            ..SenderInfo::empty()
        };
    }

    let (unit_name, _) = invoker(&chain_peer_first);
    let mut process_chain = chain_peer_first;
    process_chain.reverse(); // spec data model wants parent-first for display

    SenderInfo {
        unique_name: String::new(),
        pid: Some(pid),
        uid: Some(uid),
        unit_name,
        process_chain,
        exe_path: exe_path_of(pid),
    }
}

/// Walks `/proc/<pid>/stat` upward (following `ppid`) until pid <= 1,
/// collecting `(comm, pid)` pairs peer-first (index 0 is `pid` itself).
fn process_chain(pid: u32) -> Vec<(String, u32)> {
    let mut chain = Vec::new();
    let mut current = pid;
    let mut seen = std::collections::HashSet::new();
    while current > 1 && seen.insert(current) {
        let Some((comm, ppid)) = read_stat(current) else {
            break;
        };
        chain.push((comm, current));
        current = ppid;
    }
    chain
}

/// Parses `/proc/<pid>/stat`'s `comm` (field 2, parenthesized, may itself
/// contain spaces or parens) and `ppid` (field 4).
fn read_stat(pid: u32) -> Option<(String, u32)> {
    let contents = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let open = contents.find('(')?;
    let close = contents.rfind(')')?;
    if close <= open {
        return None;
    }
    let comm = contents[open + 1..close].to_string();
    let rest = contents[close + 1..].trim_start();
    let ppid: u32 = rest.split_whitespace().nth(1)?.parse().ok()?;
    Some((comm, ppid))
}

fn exe_path_of(pid: u32) -> Option<String> {
    fs::read_link(format!("/proc/{pid}/exe"))
        .ok()
        .map(|p: PathBuf| p.to_string_lossy().into_owned())
}

/// Picks the invoker out of a peer-first process chain: the first entry at
/// index >= 2 that is not a known shell (index 0 is the peer itself — the
/// broker's thin client; index 1 is assumed to be an intermediate tool such
/// as `git`). Falls back to the peer itself if every ancestor from index 2
/// onward is a shell, or if the chain is too short to have one.
fn invoker(chain_peer_first: &[(String, u32)]) -> (String, u32) {
    chain_peer_first
        .iter()
        .skip(2)
        .find(|(comm, _)| !KNOWN_SHELLS.contains(&comm.as_str()))
        .cloned()
        .unwrap_or_else(|| chain_peer_first[0].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoker_skips_shells_past_index_two() {
        let chain = vec![
            ("gpg-sign".into(), 100),
            ("git".into(), 99),
            ("bash".into(), 98),
            ("gnome-terminal-server".into(), 97),
        ];
        assert_eq!(invoker(&chain), ("gnome-terminal-server".into(), 97));
    }

    #[test]
    fn invoker_falls_back_to_peer_when_all_shells() {
        let chain = vec![
            ("gpg-sign".into(), 100),
            ("git".into(), 99),
            ("bash".into(), 98),
            ("sh".into(), 97),
        ];
        assert_eq!(invoker(&chain), ("gpg-sign".into(), 100));
    }

    #[test]
    fn invoker_falls_back_when_chain_too_short() {
        let chain = vec![("gpg-sign".into(), 100), ("git".into(), 99)];
        assert_eq!(invoker(&chain), ("gpg-sign".into(), 100));
    }

    #[test]
    fn read_stat_handles_parens_in_comm() {
        // Can't fabricate /proc entries in a unit test; this just exercises
        // the parser against a synthetic line shaped like the real file.
        let line = "12345 (some (weird) proc) S 100 12345 12345 0 -1 ...";
        let open = line.find('(').unwrap();
        let close = line.rfind(')').unwrap();
        assert_eq!(&line[open + 1..close], "some (weird) proc");
    }
}
