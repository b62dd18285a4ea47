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

//! Human-readable output. JSON output is plain `serde_json` of the same
//! values.

use std::fmt::Write;

use fp_core::{FallbackStatus, Outcome, PipelineReport, ServiceStatus, StrategyInfo, SystemProfile, TestReport};
use serde::Serialize;

pub fn json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}

fn marker(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "[ OK ]",
        Outcome::Warning => "[WARN]",
        Outcome::Failure => "[FAIL]",
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

pub fn report(report: &PipelineReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run {} ({})", report.run_id, report.started_at.to_rfc3339());
    if let Some(mode) = &report.mode {
        let _ = writeln!(out, "Mode: {}", mode);
    }
    let _ = writeln!(out);

    for stage in &report.stages {
        let _ = writeln!(
            out,
            "{} {:<32} {:>7}ms  {}",
            marker(stage.outcome),
            stage.stage,
            stage.duration_ms,
            stage.message
        );
        if let Some(remediation) = &stage.remediation {
            let _ = writeln!(out, "       hint: {}", remediation);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{} in {}ms: {} ok, {} warning(s), {} failure(s)",
        if report.success { "SUCCESS" } else { "FAILED" },
        report.total_duration_ms,
        report.count(Outcome::Success),
        report.count(Outcome::Warning),
        report.count(Outcome::Failure),
    );
    out
}

pub fn profile(profile: &SystemProfile) -> String {
    let devices = if profile.detected_device_ids.is_empty() {
        "none".to_string()
    } else {
        profile
            .detected_device_ids
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut out = String::new();
    let _ = writeln!(out, "Distribution:    {} {}", profile.distribution_id, profile.distribution_version);
    let _ = writeln!(out, "Package manager: {}", profile.package_manager);
    let _ = writeln!(out, "Init system:     {}", profile.init_system);
    let _ = writeln!(out, "Kernel:          {}", profile.kernel_release);
    let _ = writeln!(out, "Root:            {}", yes_no(profile.is_root));
    let _ = writeln!(out, "Target device:   {}", yes_no(profile.has_target_device()));
    let _ = writeln!(out, "USB devices:     {}", devices);
    out
}

fn service(status: &ServiceStatus) -> String {
    if !status.installed {
        return "not installed".to_string();
    }
    format!(
        "{}, {}",
        if status.active { "active" } else { "inactive" },
        if status.enabled { "enabled" } else { "disabled" }
    )
}

pub fn status(status: &FallbackStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Fallback manager: {}", if status.installed { "installed" } else { "not installed" });
    let _ = writeln!(out, "Recorded state:   {}", status.recorded_state);
    let _ = writeln!(out, "Snapshot:         {}", if status.snapshot_present { "present" } else { "none" });
    match &status.config {
        Some(config) => {
            let _ = writeln!(
                out,
                "Config:           enabled={} default_strategy={} auto_fallback={} timeout={}s",
                config.enabled, config.default_strategy, config.auto_fallback, config.timeout
            );
        }
        None => {
            let _ = writeln!(out, "Config:           absent");
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Device attached:  {}", yes_no(status.device_present));
    let _ = writeln!(out, "Device node:      {}", yes_no(status.device_node_present));
    let _ = writeln!(out, "Driver loaded:    {}", yes_no(status.driver_loaded));
    for (name, value) in &status.driver_parameters {
        let _ = writeln!(out, "  {}={}", name, value);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Services:");
    for (name, state) in &status.services {
        let _ = writeln!(out, "  {:<28} {}", name, service(state));
    }

    let active = if status.active_strategies.is_empty() {
        "none".to_string()
    } else {
        status
            .active_strategies
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let _ = writeln!(out);
    let _ = writeln!(out, "Active strategy:  {}", active);
    out
}

pub fn strategies(list: &[StrategyInfo]) -> String {
    let mut out = String::new();
    for info in list {
        let state = match (info.active, info.available) {
            (true, _) => "active".to_string(),
            (false, true) => "available".to_string(),
            (false, false) => format!(
                "unavailable: {}",
                info.unavailable_reason.as_deref().unwrap_or("unknown reason")
            ),
        };
        let _ = writeln!(out, "{:<20} {}", info.strategy, info.description);
        let _ = writeln!(out, "{:<20} {}", "", state);
    }
    out
}

pub fn test(report: &TestReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Strategy:       {}", report.strategy);
    let _ = writeln!(out, "Device:         {}", yes_no(report.device_detected));
    let _ = writeln!(out, "Communication:  {}", yes_no(report.communication));
    let _ = writeln!(out, "Recognized:     {}", yes_no(report.recognized));
    let _ = writeln!(out, "Verdict:        {}", report.verdict);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fp_core::{Completion, StageResult, Strategy, Verdict};

    #[test]
    fn test_report_lists_every_stage() {
        let error = fp_core::FpError::CompatibilityFailure {
            reasons: vec!["not running as root".into()],
        };
        let report = PipelineReport::new(
            Utc::now(),
            12,
            vec![
                StageResult::from_completion("probe_environment", Completion::success("ubuntu 24.04"), 2),
                StageResult::from_error("compatibility_check", &error, 1, false),
            ],
        );

        let text = super::report(&report);
        assert!(text.contains("[ OK ] probe_environment"));
        assert!(text.contains("[FAIL] compatibility_check"));
        assert!(text.contains("hint: fix the reported problems"));
        assert!(text.contains("FAILED"));
    }

    #[test]
    fn test_unavailable_strategy_shows_reason() {
        let list = vec![StrategyInfo {
            strategy: Strategy::MinimalDriver,
            description: Strategy::MinimalDriver.description(),
            available: false,
            unavailable_reason: Some("fp_xiaomi.ko not built".into()),
            active: false,
        }];
        assert!(strategies(&list).contains("unavailable: fp_xiaomi.ko not built"));
    }

    #[test]
    fn test_verdict_is_printed() {
        let report = TestReport {
            strategy: Strategy::UserSpaceOnly,
            verdict: Verdict::Partial,
            device_detected: true,
            communication: true,
            recognized: false,
        };
        assert!(test(&report).contains("Verdict:        partial"));
    }
}
