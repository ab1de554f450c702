// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Describe the closed set of PMC registers and their encodings.
// Author: Lukas Bower

//! PMC register descriptors.
//!
//! The PMC exposes a fixed set of three-letter registers. Rather than
//! trusting callers with free-form codes, the engine validates every request
//! against this table; anything outside it (including the interactive `UPD`
//! update-mode command, which must never be issued) is rejected as
//! unsupported without touching the line.

use crate::error::{Result, WdHwError};

/// Register access classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read-only.
    R,
    /// Write-only.
    W,
    /// Read-write.
    Rw,
}

/// Value encoding of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// One byte, hexadecimal (parsed case-insensitively, written `{:02X}`).
    U8Hex,
    /// Two bytes, hexadecimal (written `{:04X}`).
    U16Hex,
    /// Free text up to the given length (LCD lines).
    Text {
        /// Maximum number of characters accepted by the PMC.
        max: usize,
    },
}

/// A single register descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Register {
    /// Wire code.
    pub code: &'static str,
    /// Access class.
    pub access: Access,
    /// Value encoding.
    pub encoding: Encoding,
}

/// Firmware version string, `WD (PMC|BBC) v\d+`.
pub const VERSION: &str = "VER";
/// Configuration bits; bit 0 enables automatic bay power.
pub const CONFIGURATION: &str = "CFG";
/// Power-up status; bits 1 and 2 carry the socket 2/1 state at boot.
pub const STATUS: &str = "STA";
/// Interrupt status; reading clears the latched bits on the PMC.
pub const INTERRUPT_STATUS: &str = "ISR";
/// Interrupt mask.
pub const INTERRUPT_MASK: &str = "IMR";
/// Echo register; a write triggers an `ALERT` with ISR bit 7 set.
pub const ECHO: &str = "ECH";
/// LCD backlight intensity in percent.
pub const LCD_BACKLIGHT: &str = "BKL";
/// First LCD text line.
pub const LCD_LINE_1: &str = "LN1";
/// Second LCD text line.
pub const LCD_LINE_2: &str = "LN2";
/// Board temperature in degrees Celsius.
pub const TEMPERATURE: &str = "TMP";
/// Fan duty cycle in percent; the firmware rejects values above 99.
pub const FAN_SPEED: &str = "FAN";
/// Measured fan speed in RPM.
pub const FAN_RPM: &str = "RPM";
/// Fan tacho pulses per second.
pub const FAN_TACHO: &str = "TAC";
/// Steady LED bitmap.
pub const LED_STATUS: &str = "LED";
/// Blinking LED bitmap.
pub const LED_BLINK: &str = "BLK";
/// Pulsing LED bitmap (bit 0 only).
pub const LED_PULSE: &str = "PLS";
/// Drive presence bitmap; bit 4 indicates a 4-bay chassis.
pub const DRIVE_PRESENCE: &str = "DP0";
/// Drive enable plus alert LED bitmap.
pub const DRIVE_ENABLED: &str = "DE0";
/// Set bits in the drive-enable register.
pub const DRIVE_ENABLE_SET: &str = "DLS";
/// Clear bits in the drive-enable register.
pub const DRIVE_ENABLE_CLEAR: &str = "DLC";
/// Per-bay alert LED blink bitmap.
pub const DRIVE_ALERT_BLINK: &str = "DLB";

/// Maximum characters per LCD line.
pub const LCD_LINE_LEN: usize = 16;

/// Enable every PMC interrupt source.
pub const INTERRUPT_MASK_ALL: u8 = 0xFF;

/// Power LED, blue channel.
pub const LED_POWER_BLUE: u8 = 0b0000_0001;
/// Power LED, red channel.
pub const LED_POWER_RED: u8 = 0b0000_0010;
/// Power LED, green channel.
pub const LED_POWER_GREEN: u8 = 0b0000_0100;
/// All power LED channels.
pub const LED_POWER_MASK: u8 = LED_POWER_BLUE | LED_POWER_RED | LED_POWER_GREEN;
/// USB button LED, red channel.
pub const LED_USB_RED: u8 = 0b0000_1000;
/// USB button LED, blue channel.
pub const LED_USB_BLUE: u8 = 0b0001_0000;
/// All USB button LED channels.
pub const LED_USB_MASK: u8 = LED_USB_RED | LED_USB_BLUE;

/// Chassis-width indicator bit of `DP0`.
pub const DP0_FOUR_BAY: u8 = 0b0001_0000;

/// Bit offset of the per-bay alert LED flags within `DE0` and `DLB`.
pub const ALERT_LED_SHIFT: u8 = 4;

/// The supported register set.
pub const REGISTERS: &[Register] = &[
    Register { code: VERSION, access: Access::R, encoding: Encoding::Text { max: 32 } },
    Register { code: CONFIGURATION, access: Access::Rw, encoding: Encoding::U8Hex },
    Register { code: STATUS, access: Access::R, encoding: Encoding::U8Hex },
    Register { code: INTERRUPT_STATUS, access: Access::R, encoding: Encoding::U8Hex },
    Register { code: INTERRUPT_MASK, access: Access::Rw, encoding: Encoding::U8Hex },
    Register { code: ECHO, access: Access::Rw, encoding: Encoding::U8Hex },
    Register { code: LCD_BACKLIGHT, access: Access::Rw, encoding: Encoding::U8Hex },
    Register { code: LCD_LINE_1, access: Access::W, encoding: Encoding::Text { max: LCD_LINE_LEN } },
    Register { code: LCD_LINE_2, access: Access::W, encoding: Encoding::Text { max: LCD_LINE_LEN } },
    Register { code: TEMPERATURE, access: Access::R, encoding: Encoding::U8Hex },
    Register { code: FAN_SPEED, access: Access::Rw, encoding: Encoding::U8Hex },
    Register { code: FAN_RPM, access: Access::R, encoding: Encoding::U16Hex },
    Register { code: FAN_TACHO, access: Access::R, encoding: Encoding::U16Hex },
    Register { code: LED_STATUS, access: Access::Rw, encoding: Encoding::U8Hex },
    Register { code: LED_BLINK, access: Access::Rw, encoding: Encoding::U8Hex },
    Register { code: LED_PULSE, access: Access::Rw, encoding: Encoding::U8Hex },
    Register { code: DRIVE_PRESENCE, access: Access::R, encoding: Encoding::U8Hex },
    Register { code: DRIVE_ENABLED, access: Access::Rw, encoding: Encoding::U8Hex },
    Register { code: DRIVE_ENABLE_SET, access: Access::W, encoding: Encoding::U8Hex },
    Register { code: DRIVE_ENABLE_CLEAR, access: Access::W, encoding: Encoding::U8Hex },
    Register { code: DRIVE_ALERT_BLINK, access: Access::Rw, encoding: Encoding::U8Hex },
];

/// Look up a register descriptor by code.
pub fn lookup(code: &str) -> Option<&'static Register> {
    REGISTERS.iter().find(|r| r.code == code)
}

/// Look up a readable register, rejecting unknown or write-only codes.
pub fn readable(code: &str) -> Result<&'static Register> {
    match lookup(code) {
        Some(reg) if reg.access != Access::W => Ok(reg),
        _ => Err(WdHwError::Unsupported(code.to_string())),
    }
}

/// Look up a writable register, rejecting unknown or read-only codes.
pub fn writable(code: &str) -> Result<&'static Register> {
    match lookup(code) {
        Some(reg) if reg.access != Access::R => Ok(reg),
        _ => Err(WdHwError::Unsupported(code.to_string())),
    }
}

/// Parse a hexadecimal response argument into a `u8`.
pub fn parse_u8(code: &str, value: &str) -> Result<u8> {
    u8::from_str_radix(value.trim(), 16)
        .map_err(|_| WdHwError::FrameMalformed(format!("{code}: bad hex value '{value}'")))
}

/// Parse a hexadecimal response argument into a `u16`.
pub fn parse_u16(code: &str, value: &str) -> Result<u16> {
    u16::from_str_radix(value.trim(), 16)
        .map_err(|_| WdHwError::FrameMalformed(format!("{code}: bad hex value '{value}'")))
}

/// Format a `u8` the way the vendor firmware expects it.
pub fn format_u8(value: u8) -> String {
    format!("{value:02X}")
}

/// Sanitize an LCD line: printable ASCII only, truncated to the panel width.
pub fn lcd_line(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .take(LCD_LINE_LEN)
        .collect()
}
