// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Mock PMC wire shared by the integration tests.
// Author: Lukas Bower

//! Test double for the PMC: the daemon side of a socketpair runs the real
//! protocol engine, the other side plays the microcontroller.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use wdhwd::pmc::{PmcEngine, PmcEvent};

/// Start a real engine over an in-memory wire; returns the far (PMC) end.
pub fn start_engine() -> (PmcEngine, Receiver<PmcEvent>, UnixStream) {
    let (daemon_side, pmc_side) = UnixStream::pair().expect("socketpair");
    daemon_side
        .set_read_timeout(Some(Duration::from_millis(50)))
        .expect("read timeout");
    let reader = daemon_side.try_clone().expect("clone");
    let (engine, events) = PmcEngine::start(reader, daemon_side);
    (engine, events, pmc_side)
}

/// Read one CR-terminated command from the PMC side of the wire.
pub fn read_command(stream: &mut UnixStream) -> String {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) if byte[0] == b'\r' => break,
            Ok(_) => bytes.push(byte[0]),
            Err(e) => panic!("mock wire read failed: {e}"),
        }
    }
    String::from_utf8(bytes).expect("ascii command")
}

/// Send one frame (terminator appended) from the PMC side.
pub fn send(stream: &mut UnixStream, frame: &str) {
    stream
        .write_all(format!("{frame}\r").as_bytes())
        .expect("mock wire write");
}

/// A scriptable PMC: replies from a fixed table and records every command.
///
/// Getters not in the table are answered with `ERR`; setters (anything
/// containing `=`) default to `ACK`.
pub struct MockPmc {
    commands: Arc<Mutex<Vec<String>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockPmc {
    /// Run the autoresponder on the PMC side of the wire.
    pub fn autoresponder(stream: UnixStream, table: &[(&str, &str)]) -> Self {
        let table: HashMap<String, String> = table
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&commands);
        let mut stream = stream;
        let handle = thread::spawn(move || loop {
            let mut bytes = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                match stream.read(&mut byte) {
                    Ok(0) => return,
                    Ok(_) if byte[0] == b'\r' => break,
                    Ok(_) => bytes.push(byte[0]),
                    Err(_) => return,
                }
            }
            let command = String::from_utf8_lossy(&bytes).into_owned();
            log.lock().expect("command log").push(command.clone());
            let reply = match table.get(&command) {
                Some(reply) => reply.clone(),
                None if command.contains('=') => "ACK".to_string(),
                None => "ERR".to_string(),
            };
            for frame in reply.split('|') {
                if stream.write_all(format!("{frame}\r").as_bytes()).is_err() {
                    return;
                }
            }
        });
        MockPmc {
            commands,
            handle: Some(handle),
        }
    }

    /// Every command received so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("command log").clone()
    }

    /// Wait until a command matching `predicate` was seen, up to `timeout`.
    pub fn wait_for_command(&self, predicate: impl Fn(&str) -> bool, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.commands().iter().any(|c| predicate(c)) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl MockPmc {
    /// Join the responder after the engine side hung up.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
