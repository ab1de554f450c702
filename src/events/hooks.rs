// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Launch user-supplied hook programs on daemon events.
// Author: Lukas Bower

//! Notification dispatcher.
//!
//! Each recognized event may carry a user-configured hook: a command plus
//! an argument template with `{placeholder}` substitution. Hooks launch
//! detached with a per-kind concurrency cap and a bounded drop-oldest
//! backlog; a background harvester reaps every child so none is left as a
//! zombie, killing any that outlives the subprocess timeout. Hook failures
//! are logged and never fatal.

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::config::HookCommand;
use crate::daemon::ShutdownFlag;
use crate::error::Result;
use crate::thermal::AlertLevel;

/// At most this many children of one event kind run concurrently.
const MAX_RUNNING_PER_KIND: usize = 4;
/// Excess events queue up to this depth, then the oldest is dropped.
const BACKLOG_PER_KIND: usize = 32;
/// Dispatch queue depth across all kinds.
const QUEUE_DEPTH: usize = 128;

/// A hook child is killed after this long.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// The recognized notification events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Daemon finished starting.
    SystemUp,
    /// Daemon is stopping.
    SystemDown,
    /// A drive bay changed presence.
    DrivePresenceChanged,
    /// A power socket changed state.
    PowerSupplyChanged,
    /// The thermal alert level changed.
    TemperatureChanged,
    /// USB copy button, short press.
    UsbCopyButton,
    /// USB copy button, long press.
    UsbCopyButtonLong,
    /// LCD up button, short press.
    LcdUpButton,
    /// LCD up button, long press.
    LcdUpButtonLong,
    /// LCD down button, short press.
    LcdDownButton,
    /// LCD down button, long press.
    LcdDownButtonLong,
}

impl HookKind {
    /// Configuration key prefix and log name.
    pub fn name(self) -> &'static str {
        match self {
            HookKind::SystemUp => "system_up",
            HookKind::SystemDown => "system_down",
            HookKind::DrivePresenceChanged => "drive_presence_changed",
            HookKind::PowerSupplyChanged => "power_supply_changed",
            HookKind::TemperatureChanged => "temperature_changed",
            HookKind::UsbCopyButton => "usb_copy_button",
            HookKind::UsbCopyButtonLong => "usb_copy_button_long",
            HookKind::LcdUpButton => "lcd_up_button",
            HookKind::LcdUpButtonLong => "lcd_up_button_long",
            HookKind::LcdDownButton => "lcd_down_button",
            HookKind::LcdDownButtonLong => "lcd_down_button_long",
        }
    }
}

/// One event heading for the hook registry.
#[derive(Debug, Clone)]
pub struct HookEvent {
    /// Which hook to run.
    pub kind: HookKind,
    /// Placeholder substitutions applied to the argument template.
    pub substitutions: Vec<(&'static str, String)>,
}

impl HookEvent {
    /// An event without placeholders (buttons, system up/down).
    pub fn plain(kind: HookKind) -> Self {
        HookEvent {
            kind,
            substitutions: Vec::new(),
        }
    }

    /// Drive presence transition for one bay.
    pub fn drive_presence_changed(bay: u8, device: &str, present: bool) -> Self {
        HookEvent {
            kind: HookKind::DrivePresenceChanged,
            substitutions: vec![
                ("drive_bay", bay.to_string()),
                ("drive_name", device.to_string()),
                ("state", if present { "1" } else { "0" }.to_string()),
            ],
        }
    }

    /// Power socket transition.
    pub fn power_supply_changed(socket: u8, energized: bool) -> Self {
        HookEvent {
            kind: HookKind::PowerSupplyChanged,
            substitutions: vec![
                ("socket", socket.to_string()),
                ("state", if energized { "1" } else { "0" }.to_string()),
            ],
        }
    }

    /// Thermal level transition; `monitor_data` carries the hottest reading.
    pub fn temperature_changed(new: AlertLevel, old: AlertLevel, hottest: f32) -> Self {
        HookEvent {
            kind: HookKind::TemperatureChanged,
            substitutions: vec![
                ("new_level", new.name().to_string()),
                ("old_level", old.name().to_string()),
                ("monitor_data", format!("{hottest:.1}")),
            ],
        }
    }
}

fn substitute(template: &str, substitutions: &[(&'static str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in substitutions {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Hands events to the dispatcher worker. Cheap to clone.
#[derive(Clone)]
pub struct HookDispatcher {
    tx: Sender<HookEvent>,
    rx: Receiver<HookEvent>,
    registry: Arc<HashMap<HookKind, HookCommand>>,
}

impl HookDispatcher {
    /// Create a dispatcher over the configured hook registry. Events are
    /// not consumed until [`HookDispatcher::run`] is active.
    pub fn new(registry: HashMap<HookKind, HookCommand>) -> Self {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        HookDispatcher {
            tx,
            rx,
            registry: Arc::new(registry),
        }
    }

    /// Queue an event. Never blocks the caller; overflow is logged.
    pub fn dispatch(&self, event: HookEvent) {
        if self.registry.get(&event.kind).is_none() {
            debug!("no hook registered for {}", event.kind.name());
            return;
        }
        if let Err(e) = self.tx.try_send(event) {
            warn!("hook queue overflow, event dropped: {e}");
        }
    }

    /// Run a hook on the caller's thread and wait for it to finish.
    /// Used for `system_down`, which must complete before the daemon exits.
    pub fn dispatch_sync(&self, event: HookEvent) {
        if let Some(hook) = self.registry.get(&event.kind).cloned() {
            run_hook(&event, &hook);
        }
    }

    /// Worker loop: admits events under the per-kind cap, queues the rest,
    /// and keeps the harvest bookkeeping.
    pub fn run(&self, shutdown: &ShutdownFlag) -> Result<()> {
        let (done_tx, done_rx) = bounded::<HookKind>(QUEUE_DEPTH);
        let mut running: HashMap<HookKind, usize> = HashMap::new();
        let mut backlog: HashMap<HookKind, VecDeque<HookEvent>> = HashMap::new();

        loop {
            crossbeam_channel::select! {
                recv(self.rx) -> event => match event {
                    Ok(event) => self.admit(event, &mut running, &mut backlog, &done_tx),
                    Err(_) => break,
                },
                recv(done_rx) -> kind => {
                    if let Ok(kind) = kind {
                        if let Some(count) = running.get_mut(&kind) {
                            *count = count.saturating_sub(1);
                        }
                        let next = backlog.get_mut(&kind).and_then(VecDeque::pop_front);
                        if let Some(event) = next {
                            self.admit(event, &mut running, &mut backlog, &done_tx);
                        }
                    }
                },
                default(Duration::from_millis(250)) => {
                    if shutdown.is_set() {
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    fn admit(
        &self,
        event: HookEvent,
        running: &mut HashMap<HookKind, usize>,
        backlog: &mut HashMap<HookKind, VecDeque<HookEvent>>,
        done_tx: &Sender<HookKind>,
    ) {
        let Some(hook) = self.registry.get(&event.kind).cloned() else {
            return;
        };
        let count = running.entry(event.kind).or_insert(0);
        if *count >= MAX_RUNNING_PER_KIND {
            let queue = backlog.entry(event.kind).or_default();
            if queue.len() >= BACKLOG_PER_KIND {
                queue.pop_front();
                warn!(
                    "hook backlog for {} full, oldest event dropped",
                    event.kind.name()
                );
            }
            queue.push_back(event);
            return;
        }
        *count += 1;
        let done_tx = done_tx.clone();
        let kind = event.kind;
        thread::Builder::new()
            .name("hook-harvester".into())
            .spawn(move || {
                run_hook(&event, &hook);
                let _ = done_tx.send(kind);
            })
            .expect("spawn hook harvester thread");
    }
}

/// Launch one hook, wait for it (killing after the timeout), log its
/// outcome and captured output.
fn run_hook(event: &HookEvent, hook: &HookCommand) {
    let args: Vec<String> = hook
        .args
        .iter()
        .map(|template| substitute(template, &event.substitutions))
        .collect();
    debug!("running {} hook: {} {:?}", event.kind.name(), hook.command, args);

    let mut child = match Command::new(&hook.command)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!("cannot launch {} hook '{}': {e}", event.kind.name(), hook.command);
            return;
        }
    };

    let deadline = Instant::now() + HOOK_TIMEOUT;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    warn!("{} hook exceeded {}s, killing it", event.kind.name(), HOOK_TIMEOUT.as_secs());
                    let _ = child.kill();
                    break child.wait().ok();
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!("cannot reap {} hook: {e}", event.kind.name());
                break None;
            }
        }
    };

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        let _ = pipe.read_to_string(&mut stdout);
    }
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr);
    }
    for line in stdout.lines() {
        info!("{} hook: {line}", event.kind.name());
    }
    for line in stderr.lines() {
        warn!("{} hook: {line}", event.kind.name());
    }
    match status {
        Some(status) if status.success() => {}
        Some(status) => warn!("{} hook exited with {status}", event.kind.name()),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_substituted() {
        let event = HookEvent::drive_presence_changed(2, "/dev/sdc", true);
        assert_eq!(substitute("{drive_bay}", &event.substitutions), "2");
        assert_eq!(substitute("{drive_name}", &event.substitutions), "/dev/sdc");
        assert_eq!(substitute("{state}", &event.substitutions), "1");
        assert_eq!(
            substitute("bay={drive_bay},disk={drive_name}", &event.substitutions),
            "bay=2,disk=/dev/sdc"
        );
    }

    #[test]
    fn unknown_placeholders_pass_through() {
        let event = HookEvent::power_supply_changed(1, false);
        assert_eq!(substitute("{nonsense}", &event.substitutions), "{nonsense}");
    }

    #[test]
    fn dispatch_without_registered_hook_is_a_no_op() {
        let dispatcher = HookDispatcher::new(HashMap::new());
        dispatcher.dispatch(HookEvent::plain(HookKind::SystemUp));
        assert!(dispatcher.rx.is_empty());
    }

    #[test]
    fn temperature_event_carries_levels_and_data() {
        let event = HookEvent::temperature_changed(AlertLevel::Hot, AlertLevel::Warm, 66.2);
        assert_eq!(substitute("{new_level}", &event.substitutions), "hot");
        assert_eq!(substitute("{old_level}", &event.substitutions), "warm");
        assert_eq!(substitute("{monitor_data}", &event.substitutions), "66.2");
    }
}
