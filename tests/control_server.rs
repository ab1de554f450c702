// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Control socket request handling end to end.
// Author: Lukas Bower

//! Control server integration tests over a real Unix socket.

mod common;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use wdhwd::daemon::state::{MachineState, ThermalState};
use wdhwd::daemon::ShutdownFlag;
use wdhwd::server::{HwsServer, ServerContext};

use common::{start_engine, MockPmc};

fn fixture() -> (ServerContext, MockPmc, wdhwd::pmc::PmcEngine) {
    let (engine, _events, pmc_side) = start_engine();
    let mock = MockPmc::autoresponder(pmc_side, &[]);
    let devices: Vec<String> = vec!["/dev/sda".to_string(), "/dev/sdb".to_string()];
    // Two-bay chassis, right bay populated, socket 1 up.
    let machine = MachineState::from_boot_registers(
        "WD BBC v02".to_string(),
        0x03,
        0x04,
        0x8E,
        0x01,
        0x00,
        &devices,
    );
    let mut thermal = ThermalState::new(&devices);
    thermal.board_temp_c = Some(41.0);
    thermal.disks[0].temp_c = Some(38.5);
    thermal.fan_duty = 30;
    thermal.fan_target = 40;
    thermal.fan_rpm = 4320;
    let ctx = ServerContext {
        pmc: engine.clone(),
        thermal: Arc::new(Mutex::new(thermal)),
        machine: Arc::new(Mutex::new(machine)),
        shutdown_request: ShutdownFlag::new(),
    };
    (ctx, mock, engine)
}

fn roundtrip(path: &Path, request: &str) -> String {
    let mut client = UnixStream::connect(path).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    client.write_all(request.as_bytes()).expect("send");
    let mut response = String::new();
    client.read_to_string(&mut response).expect("receive");
    response
}

#[test]
fn getters_format_the_snapshots() {
    let (ctx, _mock, engine) = fixture();
    use wdhwd::server::proto::Request;

    assert_eq!(ctx.execute(Request::Version).expect("version"), "WD BBC v02");
    assert_eq!(
        ctx.execute(Request::Temperature).expect("temperature"),
        "board=41.0 /dev/sda=38.5 /dev/sdb=-"
    );
    assert_eq!(
        ctx.execute(Request::Fan).expect("fan"),
        "duty=30 target=40 rpm=4320"
    );
    assert_eq!(
        ctx.execute(Request::Drives).expect("drives"),
        "bay0=present,powered,off bay1=absent,unpowered,off"
    );
    assert_eq!(
        ctx.execute(Request::Power).expect("power"),
        "socket1=up socket2=down"
    );
    engine.close();
}

#[test]
fn lcd_set_writes_both_lines_truncated() {
    let (ctx, mock, engine) = fixture();
    use wdhwd::server::proto::Request;

    let response = ctx
        .execute(Request::LcdSet {
            line1: "IP:".to_string(),
            line2: "addr 10.0.0.1 overflowing".to_string(),
        })
        .expect("lcd set");
    assert_eq!(response, "ACK");
    assert!(mock.wait_for_command(|c| c == "LN1=IP:", Duration::from_secs(1)));
    // 16 panel columns: the second line is cut, not rejected.
    assert!(mock.wait_for_command(|c| c == "LN2=addr 10.0.0.1 ov", Duration::from_secs(1)));
    engine.close();
}

#[test]
fn shutdown_request_triggers_the_daemon_flag() {
    let (ctx, _mock, engine) = fixture();
    use wdhwd::server::proto::Request;

    assert_eq!(ctx.execute(Request::Shutdown).expect("shutdown"), "ACK");
    assert!(ctx.shutdown_request.is_set());
    engine.close();
}

#[test]
fn socket_serves_one_request_per_connection() {
    let (ctx, mock, engine) = fixture();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("hws.sock");
    let server = Arc::new(HwsServer::bind(&path, 4, None).expect("bind"));

    let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
    assert_eq!(mode & 0o777, 0o660);

    let shutdown = ShutdownFlag::new();
    let acceptor = {
        let server = Arc::clone(&server);
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || server.run(ctx, &shutdown))
    };

    assert_eq!(roundtrip(&path, "version\n"), "WD BBC v02\n");
    assert_eq!(
        roundtrip(&path, "fan\n"),
        "duty=30 target=40 rpm=4320\n"
    );
    assert_eq!(roundtrip(&path, "lcd backlight 80\n"), "ACK\n");
    assert!(mock.wait_for_command(|c| c == "BKL=50", Duration::from_secs(1)));

    let error = roundtrip(&path, "make me a sandwich\n");
    assert!(error.starts_with("ERR "), "got: {error}");

    shutdown.trigger();
    acceptor.join().expect("acceptor").expect("server");
    server.cleanup();
    engine.close();
}

#[test]
fn led_request_rewrites_the_status_register() {
    let (ctx, mock, engine) = fixture();
    use wdhwd::server::proto::Request;

    assert_eq!(ctx.execute(Request::Led(0x1B)).expect("led"), "ACK");
    assert!(mock.wait_for_command(|c| c == "LED=1B", Duration::from_secs(1)));
    engine.close();
}
