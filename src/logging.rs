/*
 * This file is part of fpinstall.
 *
 * Copyright (C) 2025 fpinstall contributors
 *
 * fpinstall is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * fpinstall is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with fpinstall. If not, see <https://www.gnu.org/licenses/>.
 */

use std::path::Path;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "FPINSTALL_LOG";

const JOURNAL_SOCKET: &str = "/run/systemd/journal/socket";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// systemd journal when available, stderr otherwise
    Journal,
}

/// Filter from `FPINSTALL_LOG`, else `debug` or `info`
pub fn filter(debug: bool) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Returns where logs actually go.
pub fn init(debug: bool, target: LogTarget) -> LogTarget {
    if target == LogTarget::Journal && Path::new(JOURNAL_SOCKET).exists() {
        match tracing_journald::layer() {
            Ok(journald) => {
                let installed = tracing_subscriber::registry()
                    .with(journald)
                    .with(filter(debug))
                    .try_init();
                if installed.is_ok() {
                    return LogTarget::Journal;
                }
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stderr", e),
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter(debug))
        .try_init();
    LogTarget::Stderr
}
