// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Enclosure LED policy for the daemon's lifecycle states.
// Author: Lukas Bower

//! Power LED policy.
//!
//! The power LED signals daemon state: blinking blue while starting,
//! steady blue in normal operation, steady red while stopping, blinking
//! red on a hardware fault. Only the power LED channels are rewritten; the
//! USB button LED bits belong to whoever drives the copy feature and are
//! preserved on every read-modify-write.

use crate::error::Result;
use crate::pmc::registers::{LED_POWER_BLUE, LED_POWER_MASK, LED_POWER_RED};
use crate::pmc::PmcEngine;

fn rewrite_power_channels(pmc: &PmcEngine, steady: u8, blink: u8) -> Result<()> {
    let status = pmc.led_status()? & !LED_POWER_MASK;
    let blinking = pmc.led_blink()? & !LED_POWER_MASK;
    pmc.set_led_pulse(false)?;
    pmc.set_led_blink(blinking | blink)?;
    pmc.set_led_status(status | steady)?;
    Ok(())
}

/// Boot-up indication: power LED blinking blue.
pub fn set_boot_state(pmc: &PmcEngine) -> Result<()> {
    rewrite_power_channels(pmc, 0, LED_POWER_BLUE)
}

/// Normal operation: power LED steady blue.
pub fn set_normal_state(pmc: &PmcEngine) -> Result<()> {
    rewrite_power_channels(pmc, LED_POWER_BLUE, 0)
}

/// Stopping or degraded: power LED steady red.
pub fn set_warning_state(pmc: &PmcEngine) -> Result<()> {
    rewrite_power_channels(pmc, LED_POWER_RED, 0)
}

/// Hardware fault: power LED blinking red.
pub fn set_error_state(pmc: &PmcEngine) -> Result<()> {
    rewrite_power_channels(pmc, 0, LED_POWER_RED)
}
