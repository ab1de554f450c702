// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Turn decoded PMC interrupts into semantic daemon events.
// Author: Lukas Bower

//! Event router.
//!
//! Consumes the protocol engine's interrupt stream and produces the
//! daemon-level behaviour: button presses are classified short or long,
//! drive-bay transitions are diffed and optionally mirrored into the bay
//! power rails, power-socket changes update the shared snapshot, and the
//! LCD backlight dims after a period of button inactivity.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};

use crate::daemon::state::SharedMachine;
use crate::daemon::ShutdownFlag;
use crate::error::{Result, WdHwError};
use crate::events::hooks::{HookDispatcher, HookEvent, HookKind};
use crate::pmc::{Button, PmcEngine, PmcEvent};

/// Default long-press threshold.
pub const LONG_PRESS: Duration = Duration::from_secs(1);

/// Router tuning, derived from the daemon configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Press duration at which a release counts as a long press.
    pub long_press: Duration,
    /// Button inactivity after which the backlight dims.
    pub dim_timeout: Duration,
    /// Backlight intensity while active, percent.
    pub intensity_normal: u8,
    /// Backlight intensity when dimmed, percent.
    pub intensity_dimmed: u8,
    /// File persisting the LCD menu cursor across restarts.
    pub menu_cursor_path: PathBuf,
}

/// The event router loop.
pub struct EventRouter {
    pmc: PmcEngine,
    events: Receiver<PmcEvent>,
    hooks: HookDispatcher,
    machine: SharedMachine,
    config: RouterConfig,
    pressed_at: HashMap<Button, Instant>,
    last_activity: Instant,
    dimmed: bool,
    menu_cursor: i64,
}

impl EventRouter {
    /// Create a router over the engine's interrupt stream.
    pub fn new(
        pmc: PmcEngine,
        events: Receiver<PmcEvent>,
        hooks: HookDispatcher,
        machine: SharedMachine,
        config: RouterConfig,
    ) -> Self {
        let menu_cursor = load_cursor(&config.menu_cursor_path);
        EventRouter {
            pmc,
            events,
            hooks,
            machine,
            config,
            pressed_at: HashMap::new(),
            last_activity: Instant::now(),
            dimmed: false,
            menu_cursor,
        }
    }

    /// Route events until shutdown is requested. A dead link is an error so
    /// the supervisor escalates instead of idling on a silent channel.
    pub fn run(&mut self, shutdown: &ShutdownFlag) -> Result<()> {
        loop {
            if shutdown.is_set() {
                return Ok(());
            }
            if !self.pmc.is_open() {
                return Err(WdHwError::LinkIo(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "PMC link closed",
                )));
            }
            match self.events.recv_timeout(Duration::from_secs(1)) {
                Ok(PmcEvent::LinkClosed) => {
                    return Err(WdHwError::LinkIo(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "PMC link closed",
                    )))
                }
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => self.maybe_dim(),
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Handle one decoded interrupt. Public for the integration tests.
    pub fn handle(&mut self, event: PmcEvent) {
        match event {
            PmcEvent::Button { button, pressed } => self.on_button(button, pressed),
            PmcEvent::DrivePresence { mask } => self.on_drive_presence(mask),
            PmcEvent::PowerSupplyChanged { socket, energized } => {
                self.on_power_supply(socket, energized)
            }
            PmcEvent::LinkClosed => {}
        }
    }

    fn on_button(&mut self, button: Button, pressed: bool) {
        self.mark_activity();
        if pressed {
            self.pressed_at.insert(button, Instant::now());
            return;
        }
        let long = match self.pressed_at.remove(&button) {
            Some(at) => at.elapsed() >= self.config.long_press,
            None => {
                warn!("release without a matching press for {button:?}");
                false
            }
        };
        let kind = hook_for_button(button, long);
        info!("{} detected", kind.name());
        self.hooks.dispatch(HookEvent::plain(kind));
        if !long {
            match button {
                Button::LcdUp => self.move_cursor(-1),
                Button::LcdDown => self.move_cursor(1),
                Button::UsbCopy => {}
            }
        }
    }

    fn on_drive_presence(&mut self, mask: u8) {
        let (auto_power, changes) = {
            let mut machine = self.machine.lock().expect("machine lock");
            let chassis = machine.chassis;
            let mut changes = Vec::new();
            for bay in machine.bays.iter_mut() {
                let bit = 1u8 << bay.index;
                // Bay bits are active-low: a set bit means the bay is empty.
                let present = mask & bit == 0;
                if present != bay.present {
                    bay.present = present;
                    changes.push((bay.index, bay.device.clone(), present, chassis.bay_label(bay.index as usize)));
                }
            }
            (machine.auto_bay_power, changes)
        };

        for (index, device, present, label) in changes {
            info!(
                "drive presence changed for bay {index} ({label}, {device}): {}",
                if present { "present" } else { "absent" }
            );
            if auto_power {
                match self.pmc.set_drive_enabled(index, present) {
                    Ok(()) => {
                        let mut machine = self.machine.lock().expect("machine lock");
                        if let Some(bay) = machine.bays.get_mut(index as usize) {
                            bay.powered = present;
                        }
                    }
                    Err(e) => warn!("cannot switch bay {index} power: {e}"),
                }
            }
            self.hooks
                .dispatch(HookEvent::drive_presence_changed(index, &device, present));
        }
    }

    fn on_power_supply(&mut self, socket: u8, energized: bool) {
        {
            let mut machine = self.machine.lock().expect("machine lock");
            if let Some(entry) = machine.sockets.iter_mut().find(|s| s.index == socket) {
                entry.energized = energized;
            }
        }
        info!(
            "power adapter on socket {socket} is now {}",
            if energized { "powered up" } else { "powered down" }
        );
        self.hooks
            .dispatch(HookEvent::power_supply_changed(socket, energized));
    }

    fn mark_activity(&mut self) {
        self.last_activity = Instant::now();
        if self.dimmed {
            self.dimmed = false;
            if let Err(e) = self.pmc.set_backlight(self.config.intensity_normal) {
                warn!("cannot restore LCD backlight: {e}");
            }
        }
    }

    fn maybe_dim(&mut self) {
        if self.dimmed
            || self.config.dim_timeout.is_zero()
            || self.last_activity.elapsed() < self.config.dim_timeout
        {
            return;
        }
        self.dimmed = true;
        if let Err(e) = self.pmc.set_backlight(self.config.intensity_dimmed) {
            warn!("cannot dim LCD backlight: {e}");
        }
    }

    fn move_cursor(&mut self, delta: i64) {
        self.menu_cursor = (self.menu_cursor + delta).max(0);
        if let Err(e) = fs::write(&self.config.menu_cursor_path, self.menu_cursor.to_string()) {
            debug!(
                "cannot persist LCD menu cursor to {}: {e}",
                self.config.menu_cursor_path.display()
            );
        }
    }

    /// Current LCD menu cursor position.
    pub fn menu_cursor(&self) -> i64 {
        self.menu_cursor
    }
}

fn hook_for_button(button: Button, long: bool) -> HookKind {
    match (button, long) {
        (Button::UsbCopy, false) => HookKind::UsbCopyButton,
        (Button::UsbCopy, true) => HookKind::UsbCopyButtonLong,
        (Button::LcdUp, false) => HookKind::LcdUpButton,
        (Button::LcdUp, true) => HookKind::LcdUpButtonLong,
        (Button::LcdDown, false) => HookKind::LcdDownButton,
        (Button::LcdDown, true) => HookKind::LcdDownButtonLong,
    }
}

fn load_cursor(path: &PathBuf) -> i64 {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}
