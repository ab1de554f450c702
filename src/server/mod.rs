// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Local control socket for querying and driving the hardware.
// Author: Lukas Bower

//! Local IPC server.
//!
//! A filesystem Unix stream socket, mode 0660 and owned by the daemon's
//! user and group, serving one newline-delimited request per connection.
//! The accept loop is bounded: past the client cap it simply stops
//! accepting until a handler finishes.

pub mod proto;

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::daemon::state::{AlertLed, SharedMachine, SharedThermal};
use crate::daemon::ShutdownFlag;
use crate::error::{Result, WdHwError};
use crate::pmc::PmcEngine;
use crate::server::proto::Request;

const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Everything a request handler may touch.
#[derive(Clone)]
pub struct ServerContext {
    /// Protocol engine for LCD/LED/backlight writes.
    pub pmc: PmcEngine,
    /// Thermal snapshot.
    pub thermal: SharedThermal,
    /// Chassis snapshot.
    pub machine: SharedMachine,
    /// Trigger for an orderly daemon shutdown.
    pub shutdown_request: ShutdownFlag,
}

impl ServerContext {
    /// Execute one parsed request. Public for the integration tests.
    pub fn execute(&self, request: Request) -> Result<String> {
        match request {
            Request::Version => {
                let version = self.machine.lock().expect("machine lock").pmc_version.clone();
                Ok(if version.is_empty() {
                    "unknown".to_string()
                } else {
                    version
                })
            }
            Request::Temperature => {
                let thermal = self.thermal.lock().expect("thermal lock");
                let mut out = format!("board={}", fmt_temp(thermal.board_temp_c));
                for disk in &thermal.disks {
                    out.push_str(&format!(" {}={}", disk.device, fmt_temp(disk.temp_c)));
                }
                Ok(out)
            }
            Request::Fan => {
                let thermal = self.thermal.lock().expect("thermal lock");
                Ok(format!(
                    "duty={} target={} rpm={}",
                    thermal.fan_duty, thermal.fan_target, thermal.fan_rpm
                ))
            }
            Request::Drives => {
                let machine = self.machine.lock().expect("machine lock");
                let bays: Vec<String> = machine
                    .bays
                    .iter()
                    .map(|bay| {
                        format!(
                            "bay{}={},{},{}",
                            bay.index,
                            if bay.present { "present" } else { "absent" },
                            if bay.powered { "powered" } else { "unpowered" },
                            match bay.alert_led {
                                AlertLed::Off => "off",
                                AlertLed::On => "on",
                                AlertLed::Blinking => "blink",
                            }
                        )
                    })
                    .collect();
                Ok(bays.join(" "))
            }
            Request::Power => {
                let machine = self.machine.lock().expect("machine lock");
                let sockets: Vec<String> = machine
                    .sockets
                    .iter()
                    .map(|socket| {
                        format!(
                            "socket{}={}",
                            socket.index,
                            if socket.energized { "up" } else { "down" }
                        )
                    })
                    .collect();
                Ok(sockets.join(" "))
            }
            Request::LcdSet { line1, line2 } => {
                self.pmc.set_lcd_text(1, &line1)?;
                self.pmc.set_lcd_text(2, &line2)?;
                Ok("ACK".to_string())
            }
            Request::LcdBacklight(percent) => {
                self.pmc.set_backlight(percent)?;
                Ok("ACK".to_string())
            }
            Request::Led(mask) => {
                self.pmc.set_led_status(mask)?;
                Ok("ACK".to_string())
            }
            Request::Shutdown => {
                info!("shutdown requested over the control socket");
                self.shutdown_request.trigger();
                Ok("ACK".to_string())
            }
        }
    }
}

fn fmt_temp(value: Option<f32>) -> String {
    match value {
        Some(celsius) => format!("{celsius:.1}"),
        None => "-".to_string(),
    }
}

/// The control socket server.
pub struct HwsServer {
    listener: UnixListener,
    path: PathBuf,
    max_clients: usize,
}

impl HwsServer {
    /// Bind the socket, apply mode 0660 and, when given, the owner.
    ///
    /// Binding happens before privileges are dropped so the socket can be
    /// chowned to the daemon user; a stale socket file is replaced.
    pub fn bind(path: &Path, max_clients: usize, owner: Option<(u32, u32)>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(WdHwError::LinkIo)?;
        }
        if path.exists() {
            debug!("removing stale control socket {}", path.display());
            fs::remove_file(path).map_err(WdHwError::LinkIo)?;
        }
        let listener = UnixListener::bind(path).map_err(WdHwError::LinkIo)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o660)).map_err(WdHwError::LinkIo)?;
        if let Some((uid, gid)) = owner {
            chown(path, uid, gid);
        }
        listener.set_nonblocking(true).map_err(WdHwError::LinkIo)?;
        info!("control socket listening at {}", path.display());
        Ok(HwsServer {
            listener,
            path: path.to_path_buf(),
            max_clients,
        })
    }

    /// Accept and serve clients until shutdown is requested.
    pub fn run(&self, ctx: ServerContext, shutdown: &ShutdownFlag) -> Result<()> {
        let active = Arc::new((Mutex::new(0usize), Condvar::new()));
        loop {
            if shutdown.is_set() {
                return Ok(());
            }
            // Bounded accept: wait below the cap before taking the next
            // connection off the queue.
            {
                let (count, cv) = &*active;
                let mut count = count.lock().expect("client count lock");
                while *count >= self.max_clients {
                    let (guard, timeout) = cv
                        .wait_timeout(count, ACCEPT_POLL)
                        .expect("client count wait");
                    count = guard;
                    if timeout.timed_out() && shutdown.is_set() {
                        return Ok(());
                    }
                }
            }
            match self.listener.accept() {
                Ok((stream, _)) => {
                    {
                        let (count, _) = &*active;
                        *count.lock().expect("client count lock") += 1;
                    }
                    let ctx = ctx.clone();
                    let active = Arc::clone(&active);
                    thread::Builder::new()
                        .name("hws-client".into())
                        .spawn(move || {
                            handle_client(stream, &ctx);
                            let (count, cv) = &*active;
                            *count.lock().expect("client count lock") -= 1;
                            cv.notify_all();
                        })
                        .expect("spawn control client thread");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!("control socket accept failed: {e}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    /// Remove the socket file. Called on orderly shutdown.
    pub fn cleanup(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("cannot remove control socket {}: {e}", self.path.display());
        }
    }
}

/// One connection, one request, one response line.
fn handle_client(stream: UnixStream, ctx: &ServerContext) {
    let _ = stream.set_read_timeout(Some(CLIENT_IO_TIMEOUT));
    let _ = stream.set_write_timeout(Some(CLIENT_IO_TIMEOUT));
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            warn!("cannot clone client stream: {e}");
            return;
        }
    });
    let mut line = String::new();
    if let Err(e) = reader.read_line(&mut line) {
        debug!("client read failed: {e}");
        return;
    }

    let response = match Request::parse(&line).and_then(|request| ctx.execute(request)) {
        Ok(response) => response,
        Err(e) => format!("ERR {e}"),
    };

    // The client may already be gone; responses to dead clients are
    // dropped rather than retried.
    let mut stream = stream;
    if let Err(e) = stream.write_all(response.as_bytes()) {
        debug!("client write failed: {e}");
        return;
    }
    let _ = stream.write_all(b"\n");
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

fn chown(path: &Path, uid: u32, gid: u32) {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    // SAFETY: cpath is a valid NUL-terminated path for the duration of the
    // call.
    let rc = unsafe { libc::chown(cpath.as_ptr(), uid, gid) };
    if rc != 0 {
        warn!(
            "cannot change ownership of {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        );
    }
}
