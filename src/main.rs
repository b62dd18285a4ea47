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

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use fp_core::{FpError, LinuxHost};
use fpinstall::cli::{Cli, Commands, FallbackCommands};
use fpinstall::commands;
use fpinstall::logging::{self, LogTarget};
use tracing::{info, warn};

/// Set by SIGINT/SIGTERM; only the monitor loop polls it
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let monitor = matches!(cli.command, Commands::Fallback(FallbackCommands::Monitor { .. }));
    let target = if monitor { LogTarget::Journal } else { LogTarget::Stderr };
    let target = logging::init(cli.verbose || cli.command.wants_debug(), target);
    info!(version = env!("CARGO_PKG_VERSION"), logging = ?target, "fpinstall starting");

    if monitor {
        if let Err(e) = ctrlc::set_handler(|| {
            info!("SIGNAL: Received SIGINT/SIGTERM, stopping monitor");
            SHUTDOWN.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to set signal handler: {}", e);
        }
    }

    let host = LinuxHost::new();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    commands::execute(cli, &host, &SHUTDOWN, &mut out).context("fpinstall")
}

fn main() {
    let cli = Cli::parse();

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            let fp = e.downcast_ref::<FpError>();
            eprintln!("error: {}", fp.map(ToString::to_string).unwrap_or_else(|| format!("{:#}", e)));
            if let Some(hint) = fp.and_then(FpError::remediation) {
                eprintln!("hint: {}", hint);
            }
            fp.map(FpError::exit_code).unwrap_or(1)
        }
    };

    std::process::exit(code);
}
