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

//! Command dispatch. Returns the process exit code; errors carry their own
//! through [`fp_core::FpError::exit_code`].

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use fp_core::{
    load_installer_config, system, Completion, FallbackManager, Host, InstallerConfig, Orchestrator, Outcome,
    PipelineReport, Result, RunMode, StateLayout, Strategy, Verdict, Verifier,
};
use tracing::debug;

use crate::cli::{Cli, Commands, FallbackCommands, InstallArgs};
use crate::monitor::Monitor;
use crate::render;

const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;

pub fn execute(cli: &Cli, host: &dyn Host, stop: &AtomicBool, out: &mut dyn Write) -> Result<i32> {
    let layout = StateLayout::new(&cli.state_root);
    let config = load_installer_config(&layout)?;
    debug!(root = %layout.root.display(), "Using state root");

    match &cli.command {
        Commands::Install(args) => install(host, layout, config, args, out),
        Commands::Verify { mode, json } => {
            let mode: RunMode = mode.parse()?;
            let report = Verifier::new(host, layout, config).run(mode);
            write_report(&report, *json || mode.forces_json(), out)
        }
        Commands::Probe { json } => {
            let profile = system::probe(host);
            if *json {
                writeln!(out, "{}", render::json(&profile)?)?;
            } else {
                write!(out, "{}", render::profile(&profile))?;
            }
            Ok(EXIT_SUCCESS)
        }
        Commands::Fallback(command) => fallback(FallbackManager::new(host, layout, config), command, stop, out),
    }
}

fn install(
    host: &dyn Host,
    layout: StateLayout,
    mut config: InstallerConfig,
    args: &InstallArgs,
    out: &mut dyn Write,
) -> Result<i32> {
    if let Some(dir) = &args.source_dir {
        config.source_dir = dir.clone();
    }
    let report = Orchestrator::new(host, layout, config).run(args.options());
    write_report(&report, args.json, out)
}

fn write_report(report: &PipelineReport, json: bool, out: &mut dyn Write) -> Result<i32> {
    if json {
        writeln!(out, "{}", report.to_json()?)?;
    } else {
        write!(out, "{}", render::report(report))?;
    }
    Ok(if report.success { EXIT_SUCCESS } else { EXIT_FAILURE })
}

fn completion(done: Completion, out: &mut dyn Write) -> Result<i32> {
    match done.outcome {
        Outcome::Warning => writeln!(out, "warning: {}", done.message)?,
        _ => writeln!(out, "{}", done.message)?,
    }
    Ok(EXIT_SUCCESS)
}

fn fallback(
    manager: FallbackManager<'_>,
    command: &FallbackCommands,
    stop: &AtomicBool,
    out: &mut dyn Write,
) -> Result<i32> {
    match command {
        FallbackCommands::Install { reinstall } => completion(manager.install(*reinstall)?, out),
        FallbackCommands::Uninstall => completion(manager.uninstall()?, out),
        FallbackCommands::Activate { strategy } => {
            let strategy: Strategy = strategy.parse()?;
            completion(manager.activate(strategy)?, out)
        }
        FallbackCommands::Restore => completion(manager.restore()?, out),
        FallbackCommands::Test { json } => {
            let report = manager.test()?;
            if *json {
                writeln!(out, "{}", render::json(&report)?)?;
            } else {
                write!(out, "{}", render::test(&report))?;
            }
            Ok(if report.verdict == Verdict::Fail { EXIT_FAILURE } else { EXIT_SUCCESS })
        }
        FallbackCommands::Status { json } => {
            let status = manager.status()?;
            if *json {
                writeln!(out, "{}", render::json(&status)?)?;
            } else {
                write!(out, "{}", render::status(&status))?;
            }
            Ok(EXIT_SUCCESS)
        }
        FallbackCommands::List { json } => {
            let list = manager.list()?;
            if *json {
                writeln!(out, "{}", render::json(&list)?)?;
            } else {
                write!(out, "{}", render::strategies(&list))?;
            }
            Ok(EXIT_SUCCESS)
        }
        FallbackCommands::Monitor { interval } => {
            Monitor::new(manager).run(Duration::from_secs((*interval).max(1)), stop);
            Ok(EXIT_SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use fp_core::{FakeHost, FpError};
    use tempfile::TempDir;

    fn run(host: &FakeHost, dir: &TempDir, args: &[&str]) -> (Result<i32>, String) {
        let root = dir.path().to_string_lossy().into_owned();
        let mut argv = vec!["fpinstall", "--state-root", root.as_str()];
        argv.extend_from_slice(args);

        let cli = Cli::try_parse_from(argv).unwrap();
        let stop = AtomicBool::new(false);
        let mut out = Vec::new();
        let code = execute(&cli, host, &stop, &mut out);
        (code, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_unknown_strategy_exit_code() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new();
        run(&host, &dir, &["fallback", "install"]).0.unwrap();

        let err = run(&host, &dir, &["fallback", "activate", "turbo"]).0.unwrap_err();
        assert!(matches!(err, FpError::UnknownStrategy(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_restore_without_backup_exit_code() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new();
        let err = run(&host, &dir, &["fallback", "restore"]).0.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_second_fallback_install_prints_warning() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new();
        let (code, _) = run(&host, &dir, &["fallback", "install"]);
        assert_eq!(code.unwrap(), 0);
        let (code, out) = run(&host, &dir, &["fallback", "install"]);
        assert_eq!(code.unwrap(), 0);
        assert!(out.starts_with("warning:"));
    }

    #[test]
    fn test_ci_mode_prints_json() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new();
        let (_, out) = run(&host, &dir, &["verify", "ci"]);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["mode"], "ci");
    }

    #[test]
    fn test_unknown_mode_is_config_error() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new();
        let err = run(&host, &dir, &["verify", "nightly"]).0.unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_probe_json() {
        let dir = TempDir::new().unwrap();
        let host = FakeHost::new().with_file("/etc/os-release", "ID=ubuntu\nVERSION_ID=\"24.04\"\n");
        let (code, out) = run(&host, &dir, &["probe", "--json"]);
        assert_eq!(code.unwrap(), 0);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["distribution_id"], "ubuntu");
        assert_eq!(value["package_manager"], "apt");
    }
}
