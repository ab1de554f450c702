// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Event router behaviour: buttons, bays, sockets, hooks.
// Author: Lukas Bower

//! Router integration tests with a scripted PMC and real hook children.

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;
use wdhwd::config::HookCommand;
use wdhwd::daemon::state::MachineState;
use wdhwd::daemon::ShutdownFlag;
use wdhwd::events::hooks::{HookDispatcher, HookKind};
use wdhwd::events::router::{EventRouter, RouterConfig};
use wdhwd::pmc::{Button, PmcEvent};

use common::{start_engine, MockPmc};

fn four_bay_machine() -> MachineState {
    let devices: Vec<String> = ["/dev/sda", "/dev/sdb", "/dev/sdc", "/dev/sdd"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    // DP0 0x90: four-bay indicator set, all bays populated (active-low);
    // CFG bit 0: automatic bay power on.
    MachineState::from_boot_registers(
        "WD BBC v02".to_string(),
        0x01,
        0x6E,
        0x90,
        0x0F,
        0x00,
        &devices,
    )
}

fn router_config(dir: &Path, long_press: Duration) -> RouterConfig {
    RouterConfig {
        long_press,
        dim_timeout: Duration::ZERO,
        intensity_normal: 60,
        intensity_dimmed: 0,
        menu_cursor_path: dir.join("lcd_menu.pos"),
    }
}

fn sh_hook(marker: &Path) -> HookCommand {
    HookCommand {
        command: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), format!("touch {}", marker.display())],
    }
}

fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn removed_drive_is_powered_down_and_state_updated() {
    let (engine, events, pmc_side) = start_engine();
    let mock = MockPmc::autoresponder(pmc_side, &[]);
    let machine = Arc::new(Mutex::new(four_bay_machine()));
    let dir = tempfile::tempdir().expect("tempdir");
    let mut router = EventRouter::new(
        engine.clone(),
        events,
        HookDispatcher::new(HashMap::new()),
        Arc::clone(&machine),
        router_config(dir.path(), Duration::from_secs(1)),
    );

    // Bay 0 goes absent: 0x90 -> 0x91 sets the bay 0 bit.
    router.handle(PmcEvent::DrivePresence { mask: 0x91 });

    assert!(mock.wait_for_command(|c| c == "DLC=01", Duration::from_secs(1)));
    {
        let machine = machine.lock().expect("machine lock");
        assert!(!machine.bays[0].present);
        assert!(!machine.bays[0].powered);
        assert!(machine.bays[1].present);
    }

    // And back in: the rail is re-enabled.
    router.handle(PmcEvent::DrivePresence { mask: 0x90 });
    assert!(mock.wait_for_command(|c| c == "DLS=01", Duration::from_secs(1)));
    assert!(machine.lock().expect("machine lock").bays[0].present);

    engine.close();
}

#[test]
fn power_socket_events_update_the_snapshot() {
    let (engine, events, pmc_side) = start_engine();
    let _mock = MockPmc::autoresponder(pmc_side, &[]);
    let machine = Arc::new(Mutex::new(four_bay_machine()));
    let dir = tempfile::tempdir().expect("tempdir");
    let mut router = EventRouter::new(
        engine.clone(),
        events,
        HookDispatcher::new(HashMap::new()),
        Arc::clone(&machine),
        router_config(dir.path(), Duration::from_secs(1)),
    );

    router.handle(PmcEvent::PowerSupplyChanged {
        socket: 1,
        energized: false,
    });
    {
        let machine = machine.lock().expect("machine lock");
        assert!(!machine.sockets[0].energized);
        assert!(machine.sockets[1].energized);
    }
    engine.close();
}

#[test]
#[serial]
fn release_after_the_threshold_runs_the_long_press_hook() {
    let (engine, events, pmc_side) = start_engine();
    let _mock = MockPmc::autoresponder(pmc_side, &[]);
    let dir = tempfile::tempdir().expect("tempdir");
    let long_marker = dir.path().join("long");
    let short_marker = dir.path().join("short");

    let mut registry = HashMap::new();
    registry.insert(HookKind::UsbCopyButtonLong, sh_hook(&long_marker));
    registry.insert(HookKind::UsbCopyButton, sh_hook(&short_marker));
    let hooks = HookDispatcher::new(registry);
    let shutdown = ShutdownFlag::new();
    let worker = {
        let hooks = hooks.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || hooks.run(&shutdown))
    };

    let machine = Arc::new(Mutex::new(four_bay_machine()));
    let mut router = EventRouter::new(
        engine.clone(),
        events,
        hooks,
        machine,
        router_config(dir.path(), Duration::from_millis(100)),
    );

    // Held for 150 ms against a 100 ms threshold: long press.
    router.handle(PmcEvent::Button {
        button: Button::UsbCopy,
        pressed: true,
    });
    thread::sleep(Duration::from_millis(150));
    router.handle(PmcEvent::Button {
        button: Button::UsbCopy,
        pressed: false,
    });

    assert!(wait_for_file(&long_marker, Duration::from_secs(3)));
    assert!(!short_marker.exists());

    shutdown.trigger();
    worker.join().expect("worker").expect("dispatcher");
    engine.close();
}

#[test]
#[serial]
fn quick_release_runs_the_short_press_hook() {
    let (engine, events, pmc_side) = start_engine();
    let _mock = MockPmc::autoresponder(pmc_side, &[]);
    let dir = tempfile::tempdir().expect("tempdir");
    let long_marker = dir.path().join("long");
    let short_marker = dir.path().join("short");

    let mut registry = HashMap::new();
    registry.insert(HookKind::LcdDownButtonLong, sh_hook(&long_marker));
    registry.insert(HookKind::LcdDownButton, sh_hook(&short_marker));
    let hooks = HookDispatcher::new(registry);
    let shutdown = ShutdownFlag::new();
    let worker = {
        let hooks = hooks.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || hooks.run(&shutdown))
    };

    let machine = Arc::new(Mutex::new(four_bay_machine()));
    let mut router = EventRouter::new(
        engine.clone(),
        events,
        hooks,
        machine,
        router_config(dir.path(), Duration::from_millis(500)),
    );

    router.handle(PmcEvent::Button {
        button: Button::LcdDown,
        pressed: true,
    });
    router.handle(PmcEvent::Button {
        button: Button::LcdDown,
        pressed: false,
    });

    assert!(wait_for_file(&short_marker, Duration::from_secs(3)));
    assert!(!long_marker.exists());
    // A short LCD-down press advances the persisted menu cursor.
    assert_eq!(router.menu_cursor(), 1);

    shutdown.trigger();
    worker.join().expect("worker").expect("dispatcher");
    engine.close();
}
