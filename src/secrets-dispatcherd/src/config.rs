// SPDX-License-Identifier: Apache-2.0

//! CLI + config-file layering for the daemon, in the style of
//! `mz-environmentd`'s CLI/config layering: a `clap` derive struct supplies
//! defaults and env-var fallbacks; an optional TOML file, if given,
//! supplies values the CLI didn't set explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use sd_core::{ManagerConfig, TrustedSignerPolicy};
use serde::Deserialize;

fn default_runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".local/state"))
                .unwrap_or_else(|| PathBuf::from("/tmp"))
        })
}

/// Command-line flags, each with an environment-variable fallback so the
/// systemd unit that runs this binary (out of scope here; see spec.md §1)
/// can configure it without a shell wrapper.
#[derive(Debug, Parser)]
#[command(name = "secrets-dispatcherd", version = sd_build_info::BUILD_INFO.version)]
pub struct Cli {
    /// Path to an optional TOML config file. CLI flags and env vars take
    /// precedence over anything set there.
    #[arg(long, env = "SD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Unix socket the local HTTP/WebSocket boundary listens on.
    #[arg(long, env = "SD_SOCKET_PATH")]
    pub socket_path: Option<PathBuf>,

    /// Directory holding the bearer credential file (`.cookie`).
    #[arg(long, env = "SD_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Name of the signer binary to locate on `$PATH` for `gpg_sign`
    /// requests (spec §4.5).
    #[arg(long, env = "SD_SIGNER")]
    pub signer: Option<String>,

    /// How many resolved requests the history ring keeps.
    #[arg(long, env = "SD_HISTORY_CAPACITY")]
    pub history_capacity: Option<usize>,

    /// Approval-cache TTL in seconds (spec default: seconds, not minutes).
    #[arg(long, env = "SD_APPROVAL_CACHE_TTL_SECS")]
    pub approval_cache_ttl_secs: Option<u64>,

    /// Auto-approve rule TTL in seconds (spec default: minutes).
    #[arg(long, env = "SD_AUTO_APPROVE_TTL_SECS")]
    pub auto_approve_ttl_secs: Option<u64>,

    /// Timeout for an interactive `RequireApproval` call, in seconds.
    #[arg(long, env = "SD_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    /// Independent timeout for a `gpg_sign` request, in seconds.
    #[arg(long, env = "SD_GPG_SIGN_TIMEOUT_SECS")]
    pub gpg_sign_timeout_secs: Option<u64>,

    /// Disable the desktop notifier boundary adapter (useful in headless
    /// test environments with no session bus).
    #[arg(long, env = "SD_NO_NOTIFY")]
    pub no_notify: bool,

    /// Disable the Secret Service D-Bus front-end.
    #[arg(long, env = "SD_NO_DBUS_PROXY")]
    pub no_dbus_proxy: bool,

    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or
    /// `secrets_dispatcherd=debug,sd_core=trace`.
    #[arg(long, env = "SD_LOG", default_value = "info")]
    pub log_filter: String,
}

/// Shape of an optional TOML config file. Every field is optional; the
/// `Cli` flag for the same setting wins if both are present.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    socket_path: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    signer: Option<String>,
    history_capacity: Option<usize>,
    approval_cache_ttl_secs: Option<u64>,
    auto_approve_ttl_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    gpg_sign_timeout_secs: Option<u64>,
    #[serde(default)]
    trusted_signers: Vec<TrustedSignerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct TrustedSignerConfig {
    exe_path: Option<String>,
    repo_path: Option<String>,
    file_prefix: Option<String>,
}

impl From<TrustedSignerConfig> for TrustedSignerPolicy {
    fn from(cfg: TrustedSignerConfig) -> Self {
        TrustedSignerPolicy {
            exe_path: cfg.exe_path,
            repo_path: cfg.repo_path,
            file_prefix: cfg.file_prefix,
        }
    }
}

/// Fully resolved configuration: CLI/env values layered over an optional
/// config file, with hardcoded defaults filling in whatever neither set.
#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
    pub signer: String,
    pub manager: ManagerConfig,
    pub log_filter: String,
    pub enable_notifier: bool,
    pub enable_dbus_proxy: bool,
}

impl Config {
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };

        let socket_path = cli
            .socket_path
            .or(file.socket_path)
            .unwrap_or_else(|| default_runtime_dir().join("secrets-dispatcher/api.sock"));
        let state_dir = cli
            .state_dir
            .or(file.state_dir)
            .unwrap_or_else(|| default_state_dir().join("secrets-dispatcher"));

        let defaults = ManagerConfig::default();
        let manager = ManagerConfig {
            approval_cache_ttl: Duration::from_secs(
                cli.approval_cache_ttl_secs
                    .or(file.approval_cache_ttl_secs)
                    .unwrap_or(defaults.approval_cache_ttl.as_secs()),
            ),
            auto_approve_ttl: Duration::from_secs(
                cli.auto_approve_ttl_secs
                    .or(file.auto_approve_ttl_secs)
                    .unwrap_or(defaults.auto_approve_ttl.as_secs()),
            ),
            history_capacity: cli
                .history_capacity
                .or(file.history_capacity)
                .unwrap_or(defaults.history_capacity),
            observer_queue_capacity: defaults.observer_queue_capacity,
            request_timeout: Duration::from_secs(
                cli.request_timeout_secs
                    .or(file.request_timeout_secs)
                    .unwrap_or(defaults.request_timeout.as_secs()),
            ),
            gpg_sign_timeout: Duration::from_secs(
                cli.gpg_sign_timeout_secs
                    .or(file.gpg_sign_timeout_secs)
                    .unwrap_or(defaults.gpg_sign_timeout.as_secs()),
            ),
            trusted_signers: file
                .trusted_signers
                .into_iter()
                .map(TrustedSignerPolicy::from)
                .collect(),
        };

        Ok(Self {
            socket_path,
            state_dir,
            signer: cli.signer.or(file.signer).unwrap_or_else(|| "gpg".to_string()),
            manager,
            log_filter: cli.log_filter,
            enable_notifier: !cli.no_notify,
            enable_dbus_proxy: !cli.no_dbus_proxy,
        })
    }

    pub fn credential_path(&self) -> PathBuf {
        self.state_dir.join(".cookie")
    }
}

fn read_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("failed to read config file {}: {err}", path.display()))?;
    toml::from_str(&contents)
        .map_err(|err| anyhow::anyhow!("failed to parse config file {}: {err}", path.display()))
}
