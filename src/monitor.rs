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

//! Fallback monitor
//!
//! Polls the primary driver's health and activates the configured default
//! strategy once it has been unhealthy for longer than the configured
//! timeout. Runs as the `fp-xiaomi-fallback-monitor` service registered by
//! `fallback install`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use fp_core::{FallbackConfig, FallbackManager, Health, Result, Strategy};
use tracing::{debug, error, info, warn};

/// Granularity of the shutdown check while sleeping between polls
const STOP_POLL: Duration = Duration::from_millis(200);

/// What one health check decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Not installed, disabled, or auto-fallback off
    Disabled,
    /// A fallback strategy is already in effect
    FallbackActive(Strategy),
    Healthy,
    /// Unhealthy, still within the grace period
    Unhealthy { reason: String, elapsed: Duration },
    Activated(Strategy),
}

pub struct Monitor<'a> {
    manager: FallbackManager<'a>,
    unhealthy_since: Option<Instant>,
}

impl<'a> Monitor<'a> {
    pub fn new(manager: FallbackManager<'a>) -> Self {
        Self {
            manager,
            unhealthy_since: None,
        }
    }

    /// One health check at `now`. Configuration is re-read every time so
    /// edits to `fallback.conf` apply without a restart.
    pub fn tick(&mut self, now: Instant) -> Result<Tick> {
        let config = match FallbackConfig::load(self.manager.layout())? {
            Some(config) if config.enabled && config.auto_fallback => config,
            _ => {
                self.unhealthy_since = None;
                return Ok(Tick::Disabled);
            }
        };

        if let Some(strategy) = self.manager.recorded_state()?.active_strategy() {
            self.unhealthy_since = None;
            return Ok(Tick::FallbackActive(strategy));
        }

        let reason = match self.manager.primary_health() {
            Health::Healthy | Health::NoDevice => {
                if self.unhealthy_since.take().is_some() {
                    info!("Primary driver recovered");
                }
                return Ok(Tick::Healthy);
            }
            Health::Unhealthy(reason) => reason,
        };

        let since = *self.unhealthy_since.get_or_insert(now);
        let elapsed = now.saturating_duration_since(since);
        if elapsed < config.timeout() {
            debug!(%reason, elapsed_secs = elapsed.as_secs(), "Primary driver unhealthy");
            return Ok(Tick::Unhealthy { reason, elapsed });
        }

        let strategy = config.default_strategy;
        warn!(%reason, %strategy, "Primary driver unhealthy past timeout, activating fallback");
        self.unhealthy_since = None;
        self.manager.activate(strategy)?;
        info!(%strategy, "Automatic fallback active");
        Ok(Tick::Activated(strategy))
    }

    /// Poll every `interval` until `stop` is set
    pub fn run(&mut self, interval: Duration, stop: &AtomicBool) {
        info!(interval_secs = interval.as_secs(), "Fallback monitor started");

        while !stop.load(Ordering::SeqCst) {
            if let Err(e) = self.tick(Instant::now()) {
                error!("Health check failed: {}", e);
            }

            let deadline = Instant::now() + interval;
            while !stop.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(STOP_POLL.min(interval));
            }
        }

        info!("Fallback monitor stopped");
    }
}
