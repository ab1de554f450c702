// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Governor behaviour against a scripted PMC.
// Author: Lukas Bower

//! Fan governor integration tests: ramping, the full-speed write quirk,
//! and the staged shutdown paths.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wdhwd::daemon::state::ThermalState;
use wdhwd::events::hooks::HookDispatcher;
use wdhwd::thermal::governor::{
    FanGovernor, GovernorConfig, ShutdownPlanner, SystemPower, Thresholds,
};
use wdhwd::thermal::AlertLevel;

use common::{start_engine, MockPmc};

struct CountingPower(Arc<AtomicUsize>);

impl SystemPower for CountingPower {
    fn power_off(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn governor_fixture(
    table: &[(&str, &str)],
    config: GovernorConfig,
) -> (
    FanGovernor,
    Arc<Mutex<ThermalState>>,
    ShutdownPlanner,
    Arc<AtomicUsize>,
    MockPmc,
    wdhwd::pmc::PmcEngine,
) {
    let (engine, _events, pmc_side) = start_engine();
    let mock = MockPmc::autoresponder(pmc_side, table);
    let thermal = Arc::new(Mutex::new(ThermalState::new(&[])));
    let fired = Arc::new(AtomicUsize::new(0));
    let planner = ShutdownPlanner::start(CountingPower(Arc::clone(&fired)));
    let governor = FanGovernor::new(
        engine.clone(),
        config,
        Arc::clone(&thermal),
        HookDispatcher::new(HashMap::new()),
        planner.clone(),
    );
    (governor, thermal, planner, fired, mock, engine)
}

#[test]
fn duty_ramps_one_step_toward_the_band_setpoint() {
    let (mut governor, thermal, planner, _fired, mock, engine) = governor_fixture(
        // Fan reads back 30% (0x1E), a healthy 4320 RPM.
        &[("FAN", "FAN=1E"), ("RPM", "RPM=10E0")],
        GovernorConfig::default(),
    );

    thermal.lock().expect("lock").board_temp_c = Some(40.0);
    governor.tick();
    {
        let snapshot = thermal.lock().expect("lock");
        assert_eq!(snapshot.level, AlertLevel::Normal);
        assert_eq!(snapshot.fan_duty, 30);
        assert_eq!(snapshot.fan_target, 30);
        assert_eq!(snapshot.fan_rpm, 4320);
    }
    // At the normal setpoint already: no FAN write may have happened.
    assert!(!mock.commands().iter().any(|c| c.starts_with("FAN=")));

    // Warm band wants 50%; one tick moves a single increment (10%).
    thermal.lock().expect("lock").board_temp_c = Some(50.0);
    governor.tick();
    assert!(mock.wait_for_command(|c| c == "FAN=28", Duration::from_secs(1)));

    planner.stop();
    engine.close();
}

#[test]
fn critical_band_forces_full_speed_written_as_99() {
    let (mut governor, thermal, planner, fired, mock, engine) = governor_fixture(
        &[
            ("FAN", "FAN=32"),
            ("RPM", "RPM=10E0"),
            ("LED", "LED=01"),
            ("BLK", "BLK=00"),
        ],
        GovernorConfig::default(),
    );

    thermal.lock().expect("lock").board_temp_c = Some(76.0);
    governor.tick();

    // Immediate power-off, error LEDs, and FAN=63 (0x63 = 99): the
    // firmware rejects a literal 100.
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(mock.wait_for_command(|c| c == "FAN=63", Duration::from_secs(1)));
    assert!(mock.wait_for_command(|c| c == "BLK=02", Duration::from_secs(1)));
    assert_eq!(thermal.lock().expect("lock").level, AlertLevel::Critical);

    planner.stop();
    engine.close();
}

#[test]
fn shutdown_band_schedules_and_cooling_cancels() {
    let (mut governor, thermal, planner, fired, _mock, engine) = governor_fixture(
        &[
            ("FAN", "FAN=32"),
            ("RPM", "RPM=10E0"),
            ("LED", "LED=01"),
            ("BLK", "BLK=00"),
        ],
        GovernorConfig {
            grace: Duration::from_secs(3600),
            ..GovernorConfig::default()
        },
    );

    thermal.lock().expect("lock").board_temp_c = Some(73.0);
    governor.tick();
    assert_eq!(thermal.lock().expect("lock").level, AlertLevel::Shutdown);
    assert!(planner.is_scheduled());

    // Dropping below the shutdown band cancels the pending power-off.
    thermal.lock().expect("lock").board_temp_c = Some(60.0);
    governor.tick();
    assert!(!planner.is_scheduled());
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    planner.stop();
    engine.close();
}

#[test]
fn stalled_fan_triggers_an_immediate_power_off() {
    let (mut governor, thermal, planner, fired, mock, engine) = governor_fixture(
        &[
            // 40% duty but essentially no rotation.
            ("FAN", "FAN=28"),
            ("RPM", "RPM=0005"),
            ("LED", "LED=01"),
            ("BLK", "BLK=00"),
        ],
        GovernorConfig::default(),
    );

    thermal.lock().expect("lock").board_temp_c = Some(40.0);
    governor.tick();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(mock.wait_for_command(|c| c == "FAN=63", Duration::from_secs(1)));

    planner.stop();
    engine.close();
}

#[test]
fn no_reading_holds_the_previous_state() {
    let (mut governor, thermal, planner, _fired, mock, engine) = governor_fixture(
        &[("FAN", "FAN=1E"), ("RPM", "RPM=10E0")],
        GovernorConfig {
            thresholds: Thresholds::default(),
            ..GovernorConfig::default()
        },
    );

    governor.tick();
    assert_eq!(thermal.lock().expect("lock").level, AlertLevel::Under);
    assert!(mock.commands().is_empty(), "no PMC traffic without readings");

    planner.stop();
    engine.close();
}
