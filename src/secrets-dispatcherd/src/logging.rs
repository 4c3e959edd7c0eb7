// SPDX-License-Identifier: Apache-2.0

//! `tracing` initialization. Deliberately minimal: a single
//! `EnvFilter`-driven fmt subscriber writing to stderr, which is what a
//! systemd-supervised daemon wants (journald captures stderr directly).

use tracing_subscriber::EnvFilter;

pub fn init(filter_directive: &str) {
    let filter = EnvFilter::try_new(filter_directive)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
