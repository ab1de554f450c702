// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Periodic acquisition of board and disk temperatures.
// Author: Lukas Bower

//! Temperature acquisition.
//!
//! Every tick the reader queries the PMC board sensor and shells out to the
//! SMART tool for each tracked disk. A failing source never fails the tick:
//! its last good value is kept and its stale counter incremented, so the
//! governor keeps acting on the freshest data available.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::daemon::state::SharedThermal;
use crate::daemon::ShutdownFlag;
use crate::error::{Result, WdHwError};
use crate::pmc::PmcEngine;

/// Default poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// How long one SMART tool invocation may run before it is killed.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

const SMART_ATTRIBUTE_TEMPERATURE: &str = "194";

/// External disk-temperature tool invocation.
#[derive(Debug, Clone)]
pub struct SmartTool {
    argv: Vec<String>,
}

impl Default for SmartTool {
    fn default() -> Self {
        SmartTool {
            argv: ["/usr/sbin/smartctl", "-A", "-d", "ata"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl SmartTool {
    /// Use a custom command line (tests point this at a stub script).
    pub fn with_argv(argv: Vec<String>) -> Self {
        SmartTool { argv }
    }

    /// Read one disk's temperature in degrees Celsius.
    pub fn disk_temperature(&self, device: &str) -> Result<f32> {
        let output = self.run_with_timeout(device)?;
        parse_smart_output(&output).ok_or_else(|| WdHwError::SubprocessFailed {
            command: self.argv[0].clone(),
            reason: format!("no temperature attribute in output for {device}"),
        })
    }

    fn run_with_timeout(&self, device: &str) -> Result<String> {
        let fail = |reason: String| WdHwError::SubprocessFailed {
            command: self.argv[0].clone(),
            reason,
        };
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .arg(device)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| fail(e.to_string()))?;

        let deadline = Instant::now() + TOOL_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let mut output = String::new();
                    if let Some(mut stdout) = child.stdout.take() {
                        let _ = stdout.read_to_string(&mut output);
                    }
                    if !status.success() {
                        return Err(fail(format!("exited with {status}")));
                    }
                    return Ok(output);
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(fail("timed out".into()));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(fail(e.to_string())),
            }
        }
    }
}

/// Extract the temperature from a SMART attribute table.
///
/// Matches the row for attribute 194 and takes its value column, the same
/// field the stock firmware tooling consumes.
fn parse_smart_output(output: &str) -> Option<f32> {
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() == Some(&SMART_ATTRIBUTE_TEMPERATURE) && fields.len() > 3 {
            if let Ok(value) = fields[3].parse::<u32>() {
                return Some(value as f32);
            }
        }
    }
    None
}

/// The periodic temperature poller.
pub struct TemperatureReader {
    pmc: PmcEngine,
    tool: SmartTool,
    thermal: SharedThermal,
    interval: Duration,
}

impl TemperatureReader {
    /// Create a poller over the given snapshot. The disk set was fixed when
    /// the snapshot was created.
    pub fn new(pmc: PmcEngine, tool: SmartTool, thermal: SharedThermal, interval: Duration) -> Self {
        TemperatureReader {
            pmc,
            tool,
            thermal,
            interval,
        }
    }

    /// Poll until shutdown is requested.
    pub fn run(&self, shutdown: &ShutdownFlag) -> Result<()> {
        self.tick();
        while !shutdown.wait_timeout(self.interval) {
            self.tick();
        }
        Ok(())
    }

    /// One acquisition pass. Public for the integration tests.
    pub fn tick(&self) {
        let board = match self.pmc.temperature() {
            Ok(celsius) => Some(f32::from(celsius)),
            Err(e) => {
                warn!("board temperature read failed: {e}");
                None
            }
        };

        let devices: Vec<String> = {
            let thermal = self.thermal.lock().expect("thermal lock");
            thermal.disks.iter().map(|d| d.device.clone()).collect()
        };
        let mut disk_readings = Vec::with_capacity(devices.len());
        for device in &devices {
            match self.tool.disk_temperature(device) {
                Ok(celsius) => {
                    debug!("{device}: {celsius:.1} degC");
                    disk_readings.push(Some(celsius));
                }
                Err(e) => {
                    warn!("disk temperature read failed for {device}: {e}");
                    disk_readings.push(None);
                }
            }
        }

        let mut thermal = self.thermal.lock().expect("thermal lock");
        match board {
            Some(celsius) => {
                thermal.board_temp_c = Some(celsius);
                thermal.board_stale = 0;
            }
            None => thermal.board_stale = thermal.board_stale.saturating_add(1),
        }
        for (disk, reading) in thermal.disks.iter_mut().zip(disk_readings) {
            match reading {
                Some(celsius) => {
                    disk.temp_c = Some(celsius);
                    disk.stale = 0;
                }
                None => disk.stale = disk.stale.saturating_add(1),
            }
        }
    }
}

/// Disk devices monitored by default on this chassis, before
/// `additional_drives` are appended.
pub fn default_disks(bays: usize) -> Vec<String> {
    const DEVICES: [&str; 4] = ["/dev/sda", "/dev/sdb", "/dev/sdc", "/dev/sdd"];
    DEVICES.iter().take(bays).map(|s| s.to_string()).collect()
}
