// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Map observed temperatures to fan duty and staged shutdown.
// Author: Lukas Bower

//! Fan governor.
//!
//! A discrete hysteretic controller: the hottest observed temperature is
//! mapped to one of eight alert bands, the fan duty cycle ramps toward the
//! band's setpoint, and the two hottest bands stage a system power-off
//! (delayed and cancellable for `Shutdown`, immediate for `Critical`).

use std::process::Command;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::daemon::leds;
use crate::daemon::state::SharedThermal;
use crate::daemon::ShutdownFlag;
use crate::error::Result;
use crate::events::hooks::{HookDispatcher, HookEvent};
use crate::pmc::PmcEngine;
use crate::thermal::AlertLevel;

/// Ascent thresholds in degrees Celsius, indexed by [`AlertLevel`].
///
/// A temperature belongs to the highest level whose threshold it meets;
/// `Under` is the floor and has no threshold of its own.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds(pub [f32; 8]);

impl Default for Thresholds {
    fn default() -> Self {
        // The stock disk bands: anything above 75 °C is beyond what the
        // drives tolerate even briefly.
        Thresholds([f32::NEG_INFINITY, 2.0, 38.0, 41.0, 65.0, 68.0, 72.0, 75.0])
    }
}

impl Thresholds {
    fn candidate(&self, temperature: f32) -> AlertLevel {
        let mut level = AlertLevel::Under;
        for candidate in AlertLevel::ALL {
            if temperature >= self.0[candidate.index()] {
                level = candidate;
            }
        }
        level
    }
}

/// Duty-cycle setpoints in percent, indexed by [`AlertLevel`].
#[derive(Debug, Clone, Copy)]
pub struct DutyTable(pub [u8; 8]);

impl Default for DutyTable {
    fn default() -> Self {
        DutyTable([20, 20, 30, 50, 99, 99, 100, 100])
    }
}

impl DutyTable {
    /// The default table with the normal band's setpoint overridden.
    pub fn with_normal(normal: u8) -> Self {
        let mut table = Self::default();
        table.0[AlertLevel::Normal.index()] = normal;
        table
    }
}

/// Tracks the alert level across ticks, applying hysteresis on descent.
///
/// Ascent is immediate: the level jumps to whatever band the temperature
/// meets (so the bands above `Hot` engage without delay). Descent happens
/// one level per update and only once the temperature has fallen below the
/// current band's threshold minus the hysteresis band.
#[derive(Debug)]
pub struct LevelTracker {
    thresholds: Thresholds,
    band: f32,
    level: AlertLevel,
}

impl LevelTracker {
    /// Create a tracker starting at `Under`.
    pub fn new(thresholds: Thresholds, band: f32) -> Self {
        LevelTracker {
            thresholds,
            band,
            level: AlertLevel::Under,
        }
    }

    /// Current level.
    pub fn level(&self) -> AlertLevel {
        self.level
    }

    /// Feed one temperature sample; returns `(new, old)` levels.
    pub fn update(&mut self, hottest: f32) -> (AlertLevel, AlertLevel) {
        let old = self.level;
        let candidate = self.thresholds.candidate(hottest);
        if candidate > self.level {
            self.level = candidate;
        } else if candidate < self.level
            && hottest < self.thresholds.0[self.level.index()] - self.band
        {
            self.level = self.level.cooler();
        }
        (self.level, old)
    }
}

/// Something that can power the system off.
pub trait SystemPower: Send + Sync {
    /// Initiate the platform power-off. Must not block for long.
    fn power_off(&self);
}

/// Powers off through `sudo shutdown`, the path granted to the daemon user.
pub struct SudoPowerOff;

impl SystemPower for SudoPowerOff {
    fn power_off(&self) {
        info!("invoking system power-off");
        match Command::new("/usr/bin/sudo")
            .args(["-n", "/sbin/shutdown", "-P", "now"])
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => error!("shutdown command exited with {status}"),
            Err(e) => error!("cannot invoke shutdown: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Idle,
    Delayed(Instant),
    Fired,
    Stopped,
}

struct PlannerShared {
    plan: Mutex<Plan>,
    cv: Condvar,
    power: Box<dyn SystemPower>,
}

/// Schedules the system power-off with an optional cancellable grace period.
#[derive(Clone)]
pub struct ShutdownPlanner {
    shared: Arc<PlannerShared>,
}

impl ShutdownPlanner {
    /// Start the planner and its timer thread.
    pub fn start(power: impl SystemPower + 'static) -> Self {
        let shared = Arc::new(PlannerShared {
            plan: Mutex::new(Plan::Idle),
            cv: Condvar::new(),
            power: Box::new(power),
        });
        let timer = Arc::clone(&shared);
        thread::Builder::new()
            .name("shutdown-planner".into())
            .spawn(move || Self::timer_loop(&timer))
            .expect("spawn shutdown planner thread");
        ShutdownPlanner { shared }
    }

    fn timer_loop(shared: &PlannerShared) {
        let mut plan = shared.plan.lock().expect("plan lock");
        loop {
            match *plan {
                Plan::Stopped => return,
                Plan::Idle | Plan::Fired => {
                    plan = shared.cv.wait(plan).expect("plan wait");
                }
                Plan::Delayed(at) => {
                    let now = Instant::now();
                    if now >= at {
                        *plan = Plan::Fired;
                        drop(plan);
                        shared.power.power_off();
                        plan = shared.plan.lock().expect("plan lock");
                    } else {
                        plan = shared
                            .cv
                            .wait_timeout(plan, at - now)
                            .expect("plan wait")
                            .0;
                    }
                }
            }
        }
    }

    /// Schedule a power-off after the grace period, unless one is already
    /// pending sooner or has fired.
    pub fn schedule_delayed(&self, grace: Duration) {
        let mut plan = self.shared.plan.lock().expect("plan lock");
        let at = Instant::now() + grace;
        match *plan {
            Plan::Idle => {
                *plan = Plan::Delayed(at);
                info!("system power-off scheduled in {}s", grace.as_secs());
            }
            Plan::Delayed(existing) if at < existing => *plan = Plan::Delayed(at),
            _ => return,
        }
        drop(plan);
        self.shared.cv.notify_all();
    }

    /// Power off now. Uncancellable.
    pub fn request_immediate(&self) {
        let mut plan = self.shared.plan.lock().expect("plan lock");
        if matches!(*plan, Plan::Fired | Plan::Stopped) {
            return;
        }
        *plan = Plan::Fired;
        drop(plan);
        self.shared.cv.notify_all();
        self.shared.power.power_off();
    }

    /// Cancel a pending delayed power-off. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut plan = self.shared.plan.lock().expect("plan lock");
        if matches!(*plan, Plan::Delayed(_)) {
            *plan = Plan::Idle;
            drop(plan);
            self.shared.cv.notify_all();
            true
        } else {
            false
        }
    }

    /// Whether a delayed power-off is currently pending.
    pub fn is_scheduled(&self) -> bool {
        matches!(
            *self.shared.plan.lock().expect("plan lock"),
            Plan::Delayed(_)
        )
    }

    /// Whether the power-off has fired.
    pub fn has_fired(&self) -> bool {
        matches!(*self.shared.plan.lock().expect("plan lock"), Plan::Fired)
    }

    /// Stop the timer thread. Fired state is not reachable afterwards.
    pub fn stop(&self) {
        let mut plan = self.shared.plan.lock().expect("plan lock");
        *plan = Plan::Stopped;
        drop(plan);
        self.shared.cv.notify_all();
    }
}

/// Governor tuning.
#[derive(Debug, Clone, Copy)]
pub struct GovernorConfig {
    /// Tick interval.
    pub interval: Duration,
    /// Ascent thresholds.
    pub thresholds: Thresholds,
    /// Duty setpoints per level.
    pub duties: DutyTable,
    /// Hysteresis band applied on descent, degrees Celsius.
    pub hysteresis_band: f32,
    /// Ramp step when speeding up, percent per tick.
    pub step_up: u8,
    /// Ramp step when slowing down, percent per tick.
    pub step_down: u8,
    /// Grace period for the delayed power-off.
    pub grace: Duration,
    /// RPM below which the fan is considered failed.
    pub rpm_floor: u16,
    /// Lowest duty the governor will command; also the spin threshold used
    /// by the failure check.
    pub duty_min: u8,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        GovernorConfig {
            interval: Duration::from_secs(10),
            thresholds: Thresholds::default(),
            duties: DutyTable::default(),
            hysteresis_band: 2.0,
            step_up: 10,
            step_down: 10,
            grace: Duration::from_secs(60),
            rpm_floor: 50,
            duty_min: 20,
        }
    }
}

/// The fan governor tick loop.
pub struct FanGovernor {
    pmc: PmcEngine,
    config: GovernorConfig,
    tracker: LevelTracker,
    thermal: SharedThermal,
    hooks: HookDispatcher,
    planner: ShutdownPlanner,
    last_wire: Option<u8>,
    fan_fault: bool,
}

impl FanGovernor {
    /// Create a governor; no PMC traffic happens until the first tick.
    pub fn new(
        pmc: PmcEngine,
        config: GovernorConfig,
        thermal: SharedThermal,
        hooks: HookDispatcher,
        planner: ShutdownPlanner,
    ) -> Self {
        let tracker = LevelTracker::new(config.thresholds, config.hysteresis_band);
        FanGovernor {
            pmc,
            config,
            tracker,
            thermal,
            hooks,
            planner,
            last_wire: None,
            fan_fault: false,
        }
    }

    /// Run ticks until shutdown is requested.
    pub fn run(&mut self, shutdown: &ShutdownFlag) -> Result<()> {
        self.tick();
        while !shutdown.wait_timeout(self.config.interval) {
            self.tick();
        }
        Ok(())
    }

    /// One governor tick. Public for the integration tests.
    pub fn tick(&mut self) {
        let hottest = self.thermal.lock().expect("thermal lock").hottest_c();
        // Without a single reading there is nothing to act on; hold state.
        let Some(hottest) = hottest else { return };

        let (new_level, old_level) = self.tracker.update(hottest);
        if new_level != old_level {
            info!(
                "temperature level changed from {} to {} (hottest source {hottest:.1} degC)",
                old_level.name(),
                new_level.name()
            );
            self.hooks
                .dispatch(HookEvent::temperature_changed(new_level, old_level, hottest));
            self.stage_shutdown(new_level, old_level);
        }
        self.drive_fan(new_level);
        self.thermal.lock().expect("thermal lock").level = new_level;
    }

    fn stage_shutdown(&mut self, new_level: AlertLevel, old_level: AlertLevel) {
        if new_level == AlertLevel::Critical {
            error!("critical overheat, powering off immediately");
            self.set_error_leds();
            self.planner.request_immediate();
        } else if new_level == AlertLevel::Shutdown {
            error!(
                "overheat, scheduling power-off in {}s",
                self.config.grace.as_secs()
            );
            self.set_error_leds();
            self.planner.schedule_delayed(self.config.grace);
        } else if old_level >= AlertLevel::Shutdown && self.planner.cancel() {
            warn!("temperature recovered, pending power-off cancelled");
            if let Err(e) = leds::set_normal_state(&self.pmc) {
                warn!("cannot restore normal LED state: {e}");
            }
        }
    }

    fn set_error_leds(&self) {
        if let Err(e) = leds::set_error_state(&self.pmc) {
            warn!("cannot set error LED state: {e}");
        }
    }

    fn drive_fan(&mut self, level: AlertLevel) {
        let current = self.pmc.fan_speed();
        let rpm = self.pmc.fan_rpm();

        let current = match current {
            Ok(value) => value,
            Err(e) => {
                warn!("cannot read fan duty, forcing full speed: {e}");
                self.command_duty(100, 0);
                return;
            }
        };
        let rpm = match rpm {
            Ok(value) => value,
            Err(e) => {
                warn!("cannot read fan RPM, forcing full speed: {e}");
                self.command_duty(100, current);
                return;
            }
        };

        if rpm < self.config.rpm_floor && current >= self.config.duty_min {
            if !self.fan_fault {
                self.fan_fault = true;
                error!("fan reports {rpm} RPM at {current}% duty, assuming fan failure");
                self.set_error_leds();
                self.planner.request_immediate();
            }
            self.command_duty(100, current);
            self.update_snapshot(current, 100, rpm);
            return;
        }
        self.fan_fault = false;

        let duties = self.config.duties.0;
        let target = match level {
            AlertLevel::Shutdown | AlertLevel::Critical => 100,
            AlertLevel::Danger => current.max(duties[AlertLevel::Danger.index()]),
            other => {
                let goal = duties[other.index()].max(self.config.duty_min);
                if current < goal {
                    current.saturating_add(self.config.step_up).min(goal)
                } else if current > goal {
                    current.saturating_sub(self.config.step_down).max(goal)
                } else {
                    current
                }
            }
        };
        self.command_duty(target, current);
        self.update_snapshot(current, target, rpm);
    }

    /// Write the duty cycle if it differs from the last commanded value.
    /// Full speed goes out as 99: the vendor firmware rejects `FAN=64`.
    fn command_duty(&mut self, target: u8, current: u8) {
        let wire = target.min(99);
        if wire == current.min(99) {
            // The fan already runs at the target; adopt it as reference.
            self.last_wire = Some(wire);
            return;
        }
        if self.last_wire == Some(wire) {
            return;
        }
        info!("setting fan duty to {target}%");
        match self.pmc.set_fan_speed(target) {
            Ok(()) => self.last_wire = Some(wire),
            Err(e) => warn!("cannot set fan duty: {e}"),
        }
    }

    fn update_snapshot(&self, duty: u8, target: u8, rpm: u16) {
        let mut thermal = self.thermal.lock().expect("thermal lock");
        thermal.fan_duty = duty;
        thermal.fan_target = target;
        thermal.fan_rpm = rpm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn level_ascends_without_hysteresis_and_descends_with_it() {
        let thresholds =
            Thresholds([f32::NEG_INFINITY, 2.0, 40.0, 50.0, 60.0, 68.0, 72.0, 75.0]);
        let mut tracker = LevelTracker::new(thresholds, 2.0);
        let readings = [38.0, 42.0, 52.0, 49.0, 47.0];
        let expected = [
            AlertLevel::Cool,
            AlertLevel::Normal,
            AlertLevel::Warm,
            AlertLevel::Warm,
            AlertLevel::Normal,
        ];
        for (reading, expected) in readings.iter().zip(expected) {
            let (level, _) = tracker.update(*reading);
            assert_eq!(level, expected, "at reading {reading}");
        }
    }

    #[test]
    fn hot_bands_engage_in_one_step() {
        let mut tracker = LevelTracker::new(Thresholds::default(), 2.0);
        let (level, old) = tracker.update(76.0);
        assert_eq!(old, AlertLevel::Under);
        assert_eq!(level, AlertLevel::Critical);
    }

    #[test]
    fn descent_is_one_level_per_tick() {
        let mut tracker = LevelTracker::new(Thresholds::default(), 2.0);
        tracker.update(66.0);
        assert_eq!(tracker.level(), AlertLevel::Hot);
        tracker.update(20.0);
        assert_eq!(tracker.level(), AlertLevel::Warm);
        tracker.update(20.0);
        assert_eq!(tracker.level(), AlertLevel::Normal);
    }

    struct CountingPower(Arc<AtomicUsize>);

    impl SystemPower for CountingPower {
        fn power_off(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn delayed_power_off_can_be_cancelled() {
        let fired = Arc::new(AtomicUsize::new(0));
        let planner = ShutdownPlanner::start(CountingPower(Arc::clone(&fired)));
        planner.schedule_delayed(Duration::from_secs(60));
        assert!(planner.is_scheduled());
        assert!(planner.cancel());
        assert!(!planner.is_scheduled());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        planner.stop();
    }

    #[test]
    fn delayed_power_off_fires_after_the_grace_period() {
        let fired = Arc::new(AtomicUsize::new(0));
        let planner = ShutdownPlanner::start(CountingPower(Arc::clone(&fired)));
        planner.schedule_delayed(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(planner.has_fired());
        assert!(!planner.cancel());
        planner.stop();
    }

    #[test]
    fn immediate_power_off_is_uncancellable_and_single_shot() {
        let fired = Arc::new(AtomicUsize::new(0));
        let planner = ShutdownPlanner::start(CountingPower(Arc::clone(&fired)));
        planner.request_immediate();
        planner.request_immediate();
        assert!(!planner.cancel());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        planner.stop();
    }
}
