// SPDX-License-Identifier: Apache-2.0

//! Build-time fingerprint of a `secrets-dispatcherd` binary: version, git
//! sha, and build timestamp. Modeled on `mz-build-info`'s `BuildInfo`: a
//! single small `const`-friendly struct, populated at compile time rather
//! than read from a file the binary might not ship with.

use semver::Version;
use serde::{Deserialize, Serialize};

/// Fingerprint of the binary that produced it.
///
/// Reported in the HTTP `GET /api/v1/status` response and the WebSocket
/// `snapshot` message, so a UI can tell a stale tab apart from a
/// freshly-restarted daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub sha: &'static str,
    pub time: &'static str,
}

impl BuildInfo {
    /// Parses `version` as a semver version. Panics if the crate's own
    /// `CARGO_PKG_VERSION` is not valid semver, which would indicate a
    /// packaging bug rather than anything recoverable at runtime.
    pub fn semver(&self) -> Version {
        Version::parse(self.version).expect("CARGO_PKG_VERSION is not valid semver")
    }
}

/// The running binary's build fingerprint.
///
/// `sha` comes from `git rev-parse HEAD` evaluated at compile time via
/// `compile-time-run`, so a build outside a git checkout (e.g. from a
/// source tarball) falls back to the literal string `compile-time-run`
/// emits on failure rather than failing the build.
pub const BUILD_INFO: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    sha: compile_time_run::run_command_str!("git", "rev-parse", "HEAD"),
    time: compile_time_run::run_command_str!("date", "-u", "+%Y-%m-%dT%H:%M:%SZ"),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_as_semver() {
        BUILD_INFO.semver();
    }
}
