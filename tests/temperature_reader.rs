// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Temperature acquisition with a stubbed SMART tool.
// Author: Lukas Bower

//! Temperature reader integration tests.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use wdhwd::daemon::state::ThermalState;
use wdhwd::thermal::reader::{SmartTool, TemperatureReader};

use common::{start_engine, MockPmc};

const SMART_LINE: &str = "194 Temperature_Celsius 0x0022 39 103 000 Old_age Always - 39";

fn stub_tool(script: &str) -> SmartTool {
    // The device path lands in $0 and is ignored by the stub.
    SmartTool::with_argv(vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        script.to_string(),
    ])
}

#[test]
fn tick_publishes_board_and_disk_readings() {
    let (engine, _events, pmc_side) = start_engine();
    let _mock = MockPmc::autoresponder(pmc_side, &[("TMP", "TMP=29")]);
    let devices = vec!["/dev/sda".to_string()];
    let thermal = Arc::new(Mutex::new(ThermalState::new(&devices)));
    let reader = TemperatureReader::new(
        engine.clone(),
        stub_tool(&format!("printf '{SMART_LINE}\\n'")),
        Arc::clone(&thermal),
        Duration::from_secs(30),
    );

    reader.tick();

    let snapshot = thermal.lock().expect("thermal lock");
    assert_eq!(snapshot.board_temp_c, Some(41.0));
    assert_eq!(snapshot.board_stale, 0);
    assert_eq!(snapshot.disks[0].temp_c, Some(39.0));
    assert_eq!(snapshot.disks[0].stale, 0);
    assert_eq!(snapshot.hottest_c(), Some(41.0));
    engine.close();
}

#[test]
fn failing_disk_source_goes_stale_without_losing_the_last_value() {
    let (engine, _events, pmc_side) = start_engine();
    let _mock = MockPmc::autoresponder(pmc_side, &[("TMP", "TMP=29")]);
    let devices = vec!["/dev/sda".to_string()];
    let thermal = Arc::new(Mutex::new(ThermalState::new(&devices)));

    let good = TemperatureReader::new(
        engine.clone(),
        stub_tool(&format!("printf '{SMART_LINE}\\n'")),
        Arc::clone(&thermal),
        Duration::from_secs(30),
    );
    good.tick();

    let failing = TemperatureReader::new(
        engine.clone(),
        stub_tool("exit 1"),
        Arc::clone(&thermal),
        Duration::from_secs(30),
    );
    failing.tick();
    failing.tick();

    let snapshot = thermal.lock().expect("thermal lock");
    assert_eq!(snapshot.disks[0].temp_c, Some(39.0), "last good value kept");
    assert_eq!(snapshot.disks[0].stale, 2);
    assert_eq!(snapshot.board_stale, 0);
    engine.close();
}
