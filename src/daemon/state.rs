// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shared thermal and chassis state snapshots.
// Author: Lukas Bower

//! Shared state snapshots.
//!
//! Two small structures carry everything the control socket needs to
//! answer queries: the thermal picture and the chassis picture. Both sit
//! behind plain mutexes held only long enough to copy fields in or out,
//! never across I/O. All writers funnel through the controller runtime's
//! subsystems.

use std::sync::{Arc, Mutex};

use crate::pmc::registers;
use crate::thermal::AlertLevel;

/// Chassis width, derived from `DP0` bit 4 and never from a model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chassis {
    /// DL2100 / PR2100 class, two drive bays.
    TwoBay,
    /// DL4100 / PR4100 class, four drive bays.
    FourBay,
}

impl Chassis {
    /// Derive the chassis width from a raw `DP0` value.
    pub fn from_presence_mask(dp0: u8) -> Self {
        if dp0 & registers::DP0_FOUR_BAY != 0 {
            Chassis::FourBay
        } else {
            Chassis::TwoBay
        }
    }

    /// Number of drive bays in this chassis.
    pub fn bays(self) -> usize {
        match self {
            Chassis::TwoBay => 2,
            Chassis::FourBay => 4,
        }
    }

    /// Human-readable position of a bay, as printed on the bezel.
    pub fn bay_label(self, bay: usize) -> &'static str {
        match (self, bay) {
            (Chassis::TwoBay, 0) => "right",
            (Chassis::TwoBay, 1) => "left",
            (Chassis::FourBay, 0) => "leftmost",
            (Chassis::FourBay, 1) => "center left",
            (Chassis::FourBay, 2) => "center right",
            (Chassis::FourBay, 3) => "rightmost",
            _ => "unknown",
        }
    }
}

/// Alert LED state of one drive bay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLed {
    /// LED dark.
    Off,
    /// LED steady on.
    On,
    /// LED blinking.
    Blinking,
}

/// One drive bay.
#[derive(Debug, Clone)]
pub struct BayState {
    /// Logical bay index (also the `DP0`/`DE0` bit index).
    pub index: u8,
    /// Disk device expected in this bay.
    pub device: String,
    /// Whether a drive is inserted.
    pub present: bool,
    /// Whether the bay's power rail is enabled.
    pub powered: bool,
    /// Alert LED state.
    pub alert_led: AlertLed,
}

/// One power-supply socket.
#[derive(Debug, Clone, Copy)]
pub struct SocketState {
    /// Socket index, 1 or 2.
    pub index: u8,
    /// Whether the socket has power.
    pub energized: bool,
}

/// Chassis-level state: bays, sockets, identity.
#[derive(Debug, Clone)]
pub struct MachineState {
    /// PMC firmware version string, empty if the read failed at startup.
    pub pmc_version: String,
    /// Chassis width.
    pub chassis: Chassis,
    /// Per-bay state, indexed by logical bay.
    pub bays: Vec<BayState>,
    /// Both power sockets.
    pub sockets: [SocketState; 2],
    /// Whether automatic bay power was enabled at startup (`CFG` bit 0).
    pub auto_bay_power: bool,
}

impl MachineState {
    /// Assemble the startup snapshot from the registers read during the
    /// boot sequence. `DP0` bay bits are active-low.
    pub fn from_boot_registers(
        version: String,
        cfg: u8,
        sta: u8,
        dp0: u8,
        de0: u8,
        dlb: u8,
        devices: &[String],
    ) -> Self {
        let chassis = Chassis::from_presence_mask(dp0);
        let bays = (0..chassis.bays())
            .map(|bay| {
                let bit = 1u8 << bay;
                let alert_bit = bit << registers::ALERT_LED_SHIFT;
                let alert_led = if dlb & alert_bit != 0 {
                    AlertLed::Blinking
                } else if de0 & alert_bit != 0 {
                    AlertLed::On
                } else {
                    AlertLed::Off
                };
                BayState {
                    index: bay as u8,
                    device: devices.get(bay).cloned().unwrap_or_default(),
                    present: dp0 & bit == 0,
                    powered: de0 & bit != 0,
                    alert_led,
                }
            })
            .collect();
        MachineState {
            pmc_version: version,
            chassis,
            bays,
            // STA carries socket 1 in bit 2 and socket 2 in bit 1,
            // mirroring the crossover in the interrupt status bits.
            sockets: [
                SocketState { index: 1, energized: sta & 0b0000_0100 != 0 },
                SocketState { index: 2, energized: sta & 0b0000_0010 != 0 },
            ],
            auto_bay_power: cfg & 0x01 != 0,
        }
    }
}

/// Temperature of one monitored disk.
#[derive(Debug, Clone)]
pub struct DiskTemp {
    /// Device path, e.g. `/dev/sda`.
    pub device: String,
    /// Last good reading, if any.
    pub temp_c: Option<f32>,
    /// Consecutive failed reads since the last good one.
    pub stale: u32,
}

/// The thermal picture: sensor values, alert level, fan telemetry.
#[derive(Debug, Clone)]
pub struct ThermalState {
    /// PMC board temperature.
    pub board_temp_c: Option<f32>,
    /// Consecutive failed board reads.
    pub board_stale: u32,
    /// Per-disk temperatures.
    pub disks: Vec<DiskTemp>,
    /// Current alert level.
    pub level: AlertLevel,
    /// Last fan duty cycle read back from the PMC, percent.
    pub fan_duty: u8,
    /// Duty cycle the governor is steering toward, percent.
    pub fan_target: u8,
    /// Last measured fan speed in RPM.
    pub fan_rpm: u16,
}

impl ThermalState {
    /// Fresh state tracking the given disk devices.
    pub fn new(devices: &[String]) -> Self {
        ThermalState {
            board_temp_c: None,
            board_stale: 0,
            disks: devices
                .iter()
                .map(|device| DiskTemp {
                    device: device.clone(),
                    temp_c: None,
                    stale: 0,
                })
                .collect(),
            level: AlertLevel::Under,
            fan_duty: 0,
            fan_target: 0,
            fan_rpm: 0,
        }
    }

    /// Hottest temperature across all sources, if any reading exists.
    pub fn hottest_c(&self) -> Option<f32> {
        let mut hottest = self.board_temp_c;
        for disk in &self.disks {
            match (hottest, disk.temp_c) {
                (Some(h), Some(d)) if d > h => hottest = Some(d),
                (None, Some(d)) => hottest = Some(d),
                _ => {}
            }
        }
        hottest
    }
}

/// Shared handle to the thermal snapshot.
pub type SharedThermal = Arc<Mutex<ThermalState>>;

/// Shared handle to the chassis snapshot.
pub type SharedMachine = Arc<Mutex<MachineState>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chassis_width_follows_dp0_bit_4() {
        assert_eq!(Chassis::from_presence_mask(0x8D), Chassis::TwoBay);
        assert_eq!(Chassis::from_presence_mask(0x90), Chassis::FourBay);
        assert_eq!(Chassis::TwoBay.bay_label(0), "right");
        assert_eq!(Chassis::FourBay.bay_label(3), "rightmost");
    }

    #[test]
    fn presence_bits_are_active_low() {
        let devices = vec!["/dev/sda".to_string(), "/dev/sdb".to_string()];
        // The observed two-bay values: 0x8D with only the left drive
        // inserted, 0xF2 with only its rail enabled.
        let state =
            MachineState::from_boot_registers(String::new(), 0x03, 0x6A, 0x8D, 0xF2, 0, &devices);
        assert_eq!(state.chassis, Chassis::TwoBay);
        assert!(!state.bays[0].present);
        assert!(state.bays[1].present);
        assert!(!state.bays[0].powered);
        assert!(state.bays[1].powered);
        assert!(state.auto_bay_power);
    }

    #[test]
    fn socket_state_from_sta() {
        let state = MachineState::from_boot_registers(String::new(), 0, 0x6A, 0x8C, 0, 0, &[]);
        // 0x6A: bit 2 clear (socket 1 down), bit 1 set (socket 2 up).
        assert!(!state.sockets[0].energized);
        assert!(state.sockets[1].energized);
    }

    #[test]
    fn hottest_picks_the_maximum_source() {
        let mut thermal = ThermalState::new(&["/dev/sda".to_string()]);
        assert_eq!(thermal.hottest_c(), None);
        thermal.board_temp_c = Some(41.0);
        thermal.disks[0].temp_c = Some(44.5);
        assert_eq!(thermal.hottest_c(), Some(44.5));
    }
}
