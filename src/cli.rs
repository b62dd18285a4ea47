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

//! Command Line Interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use fp_core::constants::fallback::DEFAULT_MONITOR_INTERVAL_SECS;
use fp_core::PipelineOptions;

#[derive(Parser, Debug)]
#[command(name = "fpinstall")]
#[command(version)]
#[command(about = "fpinstall - FPC fingerprint reader installer for Xiaomi laptops")]
#[command(long_about = "fpinstall - FPC fingerprint reader installer for Xiaomi laptops

Installs the fp_xiaomi driver for the FPC reader (USB 10a5:9201) and, when
the driver cannot be used, switches to a degraded fallback mode.

EXAMPLES:
    fpinstall install                          Full installation
    fpinstall install --force --install-fallback
    fpinstall install --skip-tests --json      Install without checks, JSON report
    fpinstall verify standard                  Re-run checks without installing
    fpinstall verify ci                        Checks with a JSON report
    fpinstall probe                            Show the detected environment
    fpinstall fallback list                    Strategies and their availability
    fpinstall fallback activate compat         Reload the driver in compatibility mode
    fpinstall fallback test                    Probe the active strategy
    fpinstall fallback restore                 Undo the active strategy

ENVIRONMENT VARIABLES:
    FPINSTALL_LOG=debug    Log filter (tracing EnvFilter syntax)

EXIT CODES:
    0    Success, warnings allowed
    1    Failure
    2    Unknown strategy
    3    Nothing to restore
    4    Strategy activation failed
    5    Another fpinstall process holds the state lock

FILES:
    /etc/fpinstall/installer.json        Installer settings
    /etc/fpinstall/fallback.conf         Fallback configuration (key=value)
    /var/lib/fpinstall/state.json        Fallback state record
    /var/lib/fpinstall/backup/           Pre-fallback snapshot
    /run/fpinstall.lock                  State lock")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Prefix for configuration, state and lock files
    #[arg(long, global = true, value_name = "DIR", default_value = "/")]
    pub state_root: PathBuf,

    /// Verbose logging
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the installation pipeline
    Install(InstallArgs),

    /// Run read-only checks in one of the verification modes
    Verify {
        /// quick, standard, comprehensive, ci, development or release
        mode: String,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the detected environment
    Probe {
        /// Print the profile as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fallback strategy management
    #[command(subcommand, about = "Back up, activate, test and restore fallback strategies")]
    Fallback(FallbackCommands),
}

// ============================================================================
// Install
// ============================================================================

#[derive(Args, Debug, Default)]
pub struct InstallArgs {
    /// Continue past compatibility and driver load failures
    #[arg(long)]
    pub force: bool,
    /// Skip the compatibility gate and post-install checks
    #[arg(long)]
    pub skip_tests: bool,
    /// Load the driver with debug output and log verbosely
    #[arg(long)]
    pub debug: bool,
    /// Prepare the fallback manager
    #[arg(long)]
    pub install_fallback: bool,
    /// Leave services untouched
    #[arg(long)]
    pub no_auto_configure: bool,
    /// Driver source tree (overrides installer.json)
    #[arg(long, value_name = "DIR")]
    pub source_dir: Option<PathBuf>,
    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl InstallArgs {
    pub fn options(&self) -> PipelineOptions {
        PipelineOptions {
            force: self.force,
            skip_tests: self.skip_tests,
            debug: self.debug,
            install_fallback: self.install_fallback,
            auto_configure: !self.no_auto_configure,
        }
    }
}

// ============================================================================
// Fallback Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum FallbackCommands {
    /// Write the fallback configuration and register the monitor hook
    Install {
        /// Rewrite configuration and hook even if already installed
        #[arg(long)]
        reinstall: bool,
    },
    /// Remove the monitor hook, configuration and state
    Uninstall,
    /// Back up the current state and switch to a strategy
    Activate {
        /// generic-library, compatibility-mode, minimal-driver or user-space-only
        strategy: String,
    },
    /// Revert the active strategy using the backup
    Restore,
    /// Probe the active strategy
    Test {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show live driver, device and service state
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// List strategies and whether they can be activated
    List {
        /// Print the list as JSON
        #[arg(long)]
        json: bool,
    },
    /// Watch the primary driver and fall back automatically
    Monitor {
        /// Seconds between health checks
        #[arg(long, default_value_t = DEFAULT_MONITOR_INTERVAL_SECS)]
        interval: u64,
    },
}

impl Commands {
    /// Whether the command asked for debug-level logging
    pub fn wants_debug(&self) -> bool {
        match self {
            Commands::Install(args) => args.debug,
            Commands::Verify { mode, .. } => mode
                .parse::<fp_core::RunMode>()
                .map(|m| m.debug_logging())
                .unwrap_or(false),
            _ => false,
        }
    }
}
