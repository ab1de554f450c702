// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Multiplex commands, responses, and interrupts over the PMC link.
// Author: Lukas Bower

//! PMC protocol engine.
//!
//! The PMC speaks a half-duplex request/response protocol at the frame
//! level, with unsolicited `ALERT` frames interleaved whenever an interrupt
//! is latched. The engine presents a synchronous request API while a
//! background reader consumes frames and a dedicated interrupt thread
//! answers every `ALERT` with an `ISR` read before the next user command is
//! admitted to the line.
//!
//! Serialization invariant: at most one command is outstanding at any
//! instant, and commands complete in issue order.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, warn};

use crate::error::{Result, WdHwError};
use crate::pmc::frame::{Frame, FrameKind};
use crate::pmc::link::{FrameReader, FrameWriter, ReadEvent};
use crate::pmc::registers::{self, Encoding};

/// Deadline for getters and setters.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
/// Deadline for the echo round-trip, which completes via an interrupt.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a drain waits for one frame before declaring the line idle.
const DRAIN_IDLE: Duration = Duration::from_millis(500);

const INTERRUPT_QUEUE_DEPTH: usize = 16;
const EVENT_QUEUE_DEPTH: usize = 64;

const ISR_POWER_SOCKET_2: u8 = 1 << 1;
const ISR_POWER_SOCKET_1: u8 = 1 << 2;
const ISR_USB_COPY_BUTTON: u8 = 1 << 3;
const ISR_DRIVE_PRESENCE: u8 = 1 << 4;
const ISR_LCD_UP_BUTTON: u8 = 1 << 5;
const ISR_LCD_DOWN_BUTTON: u8 = 1 << 6;
const ISR_ECHO: u8 = 1 << 7;

const STA_POWER_SOCKET_2: u8 = 1 << 1;
const STA_POWER_SOCKET_1: u8 = 1 << 2;

/// Front-panel buttons wired to the PMC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    /// USB copy button next to the front USB port.
    UsbCopy,
    /// LCD scroll-up button.
    LcdUp,
    /// LCD scroll-down button.
    LcdDown,
}

/// Decoded interrupt events delivered to the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PmcEvent {
    /// A power socket changed state; `energized` is the new state.
    PowerSupplyChanged {
        /// Socket index, 1 or 2.
        socket: u8,
        /// Whether the socket now has power.
        energized: bool,
    },
    /// A front-panel button changed state.
    Button {
        /// Which button.
        button: Button,
        /// `true` on the press edge, `false` on release.
        pressed: bool,
    },
    /// The drive presence bitmap changed; carries the fresh `DP0` value.
    DrivePresence {
        /// Raw presence bitmap (bay bits are active-low).
        mask: u8,
    },
    /// The serial link is gone; no further events will follow.
    LinkClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Response,
    Ack,
    AlertEcho,
}

struct Pending {
    code: String,
    expect: Expect,
    outcome: Option<Result<Option<String>>>,
}

#[derive(Default)]
struct Gate {
    busy: bool,
    isr_debt: u32,
}

enum InterruptSignal {
    Alert,
    Closed,
}

struct Shared {
    slot: Mutex<Option<Pending>>,
    slot_cv: Condvar,
    gate: Mutex<Gate>,
    gate_cv: Condvar,
    frames_seen: Mutex<u64>,
    frames_cv: Condvar,
    closed: AtomicBool,
    writer: Mutex<FrameWriter<Box<dyn Write + Send>>>,
    isr_tx: Sender<InterruptSignal>,
    events_tx: Sender<PmcEvent>,
    button_state: Mutex<u8>,
}

/// Handle to the protocol engine. Cheap to clone; all clones share the link.
#[derive(Clone)]
pub struct PmcEngine {
    shared: Arc<Shared>,
}

impl PmcEngine {
    /// Start the engine over the given link halves.
    ///
    /// Returns the engine handle and the bounded channel of decoded
    /// interrupt events. The reader must yield `ReadEvent::Idle`
    /// periodically (a read timeout on the port) so shutdown is noticed.
    pub fn start<R, W>(reader: R, writer: W) -> (Self, Receiver<PmcEvent>)
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (isr_tx, isr_rx) = bounded(INTERRUPT_QUEUE_DEPTH);
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_DEPTH);
        let engine = PmcEngine {
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                slot_cv: Condvar::new(),
                gate: Mutex::new(Gate::default()),
                gate_cv: Condvar::new(),
                frames_seen: Mutex::new(0),
                frames_cv: Condvar::new(),
                closed: AtomicBool::new(false),
                writer: Mutex::new(FrameWriter::new(Box::new(writer) as Box<dyn Write + Send>)),
                isr_tx,
                events_tx,
                button_state: Mutex::new(0),
            }),
        };

        let read_engine = engine.clone();
        thread::Builder::new()
            .name("pmc-reader".into())
            .spawn(move || read_engine.reader_loop(FrameReader::new(reader)))
            .expect("spawn pmc reader thread");

        let isr_engine = engine.clone();
        thread::Builder::new()
            .name("pmc-interrupts".into())
            .spawn(move || isr_engine.interrupt_loop(isr_rx))
            .expect("spawn pmc interrupt thread");

        (engine, events_rx)
    }

    /// Stop accepting requests and wake every waiter. Idempotent.
    pub fn close(&self) {
        self.mark_closed();
    }

    /// Whether the link is still usable.
    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    // ---- request API -----------------------------------------------------

    /// Read a register, returning the raw response argument.
    pub fn get(&self, code: &str) -> Result<Option<String>> {
        registers::readable(code)?;
        self.request(code, None, Expect::Response, COMMAND_TIMEOUT, false)
    }

    /// Read a one-byte hexadecimal register.
    pub fn get_u8(&self, code: &str) -> Result<u8> {
        let reg = registers::readable(code)?;
        debug_assert_eq!(reg.encoding, Encoding::U8Hex);
        let value = self.value_of(code)?;
        registers::parse_u8(code, &value)
    }

    /// Read a two-byte hexadecimal register.
    pub fn get_u16(&self, code: &str) -> Result<u16> {
        let reg = registers::readable(code)?;
        debug_assert_eq!(reg.encoding, Encoding::U16Hex);
        let value = self.value_of(code)?;
        registers::parse_u16(code, &value)
    }

    /// Read a text register.
    pub fn get_text(&self, code: &str) -> Result<String> {
        registers::readable(code)?;
        self.value_of(code)
    }

    /// Write a one-byte hexadecimal register; completes on `ACK`.
    pub fn set_u8(&self, code: &str, value: u8) -> Result<()> {
        registers::writable(code)?;
        self.request(
            code,
            Some(registers::format_u8(value)),
            Expect::Ack,
            COMMAND_TIMEOUT,
            false,
        )
        .map(|_| ())
    }

    /// Write a text register; completes on `ACK`.
    pub fn set_text(&self, code: &str, value: &str) -> Result<()> {
        let reg = registers::writable(code)?;
        let text = match reg.encoding {
            Encoding::Text { max } => value.chars().take(max).collect::<String>(),
            _ => return Err(WdHwError::Unsupported(code.to_string())),
        };
        self.request(code, Some(text), Expect::Ack, COMMAND_TIMEOUT, false)
            .map(|_| ())
    }

    /// Write the echo register and wait for the PMC to raise the matching
    /// interrupt (`ALERT` with ISR bit 7).
    pub fn echo(&self, value: u8) -> Result<()> {
        self.request(
            registers::ECHO,
            Some(registers::format_u8(value)),
            Expect::AlertEcho,
            ECHO_TIMEOUT,
            false,
        )
        .map(|_| ())
    }

    // ---- high-level register surface ------------------------------------

    /// PMC firmware version string, e.g. `WD BBC v02`.
    pub fn version(&self) -> Result<String> {
        self.get_text(registers::VERSION)
    }

    /// Configuration register.
    pub fn configuration(&self) -> Result<u8> {
        self.get_u8(registers::CONFIGURATION)
    }

    /// Enable or disable automatic bay power.
    ///
    /// Only the known auto-power bit is modified; the remaining
    /// configuration bits are undocumented and preserved as read.
    pub fn set_auto_bay_power(&self, enable: bool) -> Result<()> {
        let current = self.configuration()?;
        let updated = if enable { current | 0x01 } else { current & !0x01 };
        self.set_u8(registers::CONFIGURATION, updated)
    }

    /// Power-up status register.
    pub fn status(&self) -> Result<u8> {
        self.get_u8(registers::STATUS)
    }

    /// Unmask all PMC interrupt sources.
    pub fn enable_all_interrupts(&self) -> Result<()> {
        self.set_u8(registers::INTERRUPT_MASK, registers::INTERRUPT_MASK_ALL)
    }

    /// Board temperature in degrees Celsius.
    pub fn temperature(&self) -> Result<u8> {
        self.get_u8(registers::TEMPERATURE)
    }

    /// Configured fan duty cycle in percent.
    pub fn fan_speed(&self) -> Result<u8> {
        self.get_u8(registers::FAN_SPEED)
    }

    /// Set the fan duty cycle in percent.
    ///
    /// The vendor firmware rejects 100 as a direct setpoint; full speed is
    /// requested by writing 99, matching the stock wdhws behaviour.
    pub fn set_fan_speed(&self, percent: u8) -> Result<()> {
        self.set_u8(registers::FAN_SPEED, percent.min(99))
    }

    /// Measured fan speed in RPM.
    pub fn fan_rpm(&self) -> Result<u16> {
        self.get_u16(registers::FAN_RPM)
    }

    /// Fan tacho pulses per second.
    pub fn fan_tacho(&self) -> Result<u16> {
        self.get_u16(registers::FAN_TACHO)
    }

    /// Steady LED bitmap.
    pub fn led_status(&self) -> Result<u8> {
        self.get_u8(registers::LED_STATUS)
    }

    /// Set the steady LED bitmap.
    pub fn set_led_status(&self, mask: u8) -> Result<()> {
        self.set_u8(registers::LED_STATUS, mask)
    }

    /// Blinking LED bitmap.
    pub fn led_blink(&self) -> Result<u8> {
        self.get_u8(registers::LED_BLINK)
    }

    /// Set the blinking LED bitmap.
    pub fn set_led_blink(&self, mask: u8) -> Result<()> {
        self.set_u8(registers::LED_BLINK, mask)
    }

    /// Turn power LED pulsing on or off.
    pub fn set_led_pulse(&self, pulse: bool) -> Result<()> {
        self.set_u8(registers::LED_PULSE, u8::from(pulse))
    }

    /// LCD backlight intensity in percent.
    pub fn backlight(&self) -> Result<u8> {
        self.get_u8(registers::LCD_BACKLIGHT)
    }

    /// Set the LCD backlight intensity in percent.
    pub fn set_backlight(&self, percent: u8) -> Result<()> {
        self.set_u8(registers::LCD_BACKLIGHT, percent.min(100))
    }

    /// Write one LCD text line (1 or 2), truncated to the panel width.
    pub fn set_lcd_text(&self, line: u8, text: &str) -> Result<()> {
        let code = match line {
            1 => registers::LCD_LINE_1,
            2 => registers::LCD_LINE_2,
            _ => return Err(WdHwError::Unsupported(format!("LN{line}"))),
        };
        self.set_text(code, &registers::lcd_line(text))
    }

    /// Drive presence bitmap (`DP0`).
    pub fn drive_presence(&self) -> Result<u8> {
        self.get_u8(registers::DRIVE_PRESENCE)
    }

    /// Drive enable plus alert LED bitmap (`DE0`).
    pub fn drive_enabled(&self) -> Result<u8> {
        self.get_u8(registers::DRIVE_ENABLED)
    }

    /// Power a drive bay up or down via the set/clear registers.
    pub fn set_drive_enabled(&self, bay: u8, enable: bool) -> Result<()> {
        let mask = 1u8 << bay;
        if enable {
            self.set_u8(registers::DRIVE_ENABLE_SET, mask)
        } else {
            self.set_u8(registers::DRIVE_ENABLE_CLEAR, mask)
        }
    }

    /// Per-bay alert LED blink bitmap (`DLB`).
    pub fn drive_alert_blink(&self) -> Result<u8> {
        self.get_u8(registers::DRIVE_ALERT_BLINK)
    }

    /// Set the per-bay alert LED blink bitmap.
    pub fn set_drive_alert_blink(&self, mask: u8) -> Result<()> {
        self.set_u8(registers::DRIVE_ALERT_BLINK, mask)
    }

    // ---- request plumbing ------------------------------------------------

    fn value_of(&self, code: &str) -> Result<String> {
        self.request(code, None, Expect::Response, COMMAND_TIMEOUT, false)?
            .ok_or_else(|| WdHwError::FrameMalformed(format!("{code}: response carried no value")))
    }

    fn request(
        &self,
        code: &str,
        value: Option<String>,
        expect: Expect,
        timeout: Duration,
        priority: bool,
    ) -> Result<Option<String>> {
        match self.transceive(code, value.as_deref(), expect, timeout, priority) {
            Err(e) if e.is_recoverable() => {
                warn!("PMC command {code} failed ({e}), draining and retrying once");
                self.drain_window();
                self.transceive(code, value.as_deref(), expect, timeout, priority)
            }
            other => other,
        }
    }

    fn transceive(
        &self,
        code: &str,
        value: Option<&str>,
        expect: Expect,
        timeout: Duration,
        priority: bool,
    ) -> Result<Option<String>> {
        self.acquire_gate(priority)?;
        let outcome = self.transceive_gated(code, value, expect, timeout);
        self.release_gate();
        outcome
    }

    fn transceive_gated(
        &self,
        code: &str,
        value: Option<&str>,
        expect: Expect,
        timeout: Duration,
    ) -> Result<Option<String>> {
        {
            let mut slot = self.shared.slot.lock().expect("slot lock");
            debug_assert!(slot.is_none(), "command slot must be free under the gate");
            *slot = Some(Pending {
                code: code.to_string(),
                expect,
                outcome: None,
            });
        }

        if let Err(e) = self
            .shared
            .writer
            .lock()
            .expect("writer lock")
            .write_frame(code, value)
        {
            self.shared.slot.lock().expect("slot lock").take();
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock().expect("slot lock");
        loop {
            if slot.as_ref().is_some_and(|p| p.outcome.is_some()) {
                let pending = slot.take().expect("pending checked above");
                return pending.outcome.expect("outcome checked above");
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                slot.take();
                return Err(WdHwError::LinkIo(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "PMC link closed",
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                slot.take();
                drop(slot);
                self.drain_window();
                return Err(WdHwError::Timeout(code.to_string()));
            }
            let (guard, _) = self
                .shared
                .slot_cv
                .wait_timeout(slot, deadline - now)
                .expect("slot wait");
            slot = guard;
        }
    }

    fn acquire_gate(&self, priority: bool) -> Result<()> {
        let mut gate = self.shared.gate.lock().expect("gate lock");
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(WdHwError::LinkIo(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "PMC link closed",
                )));
            }
            if !gate.busy && (priority || gate.isr_debt == 0) {
                gate.busy = true;
                return Ok(());
            }
            gate = self.shared.gate_cv.wait(gate).expect("gate wait");
        }
    }

    fn release_gate(&self) {
        let mut gate = self.shared.gate.lock().expect("gate lock");
        gate.busy = false;
        drop(gate);
        self.shared.gate_cv.notify_all();
    }

    /// Wait until the reader consumes one more frame or the line stays idle
    /// for the drain window. Used after timeouts and protocol violations so
    /// a straggling response does not corrupt the next exchange.
    fn drain_window(&self) {
        let deadline = Instant::now() + DRAIN_IDLE;
        let mut seen = self.shared.frames_seen.lock().expect("frames lock");
        let start = *seen;
        while *seen == start && !self.shared.closed.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .shared
                .frames_cv
                .wait_timeout(seen, deadline - now)
                .expect("frames wait");
            seen = guard;
        }
    }

    // ---- reader thread ---------------------------------------------------

    fn reader_loop<R: Read>(&self, mut reader: FrameReader<R>) {
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                break;
            }
            match reader.next() {
                Ok(ReadEvent::Frame(frame)) => {
                    self.note_frame();
                    self.dispatch_frame(frame);
                }
                Ok(ReadEvent::Idle) => continue,
                Ok(ReadEvent::Closed) => {
                    debug!("PMC link reached end of stream");
                    self.mark_closed();
                    break;
                }
                Err(e) => {
                    error!("PMC link read failed: {e}");
                    self.mark_closed();
                    break;
                }
            }
        }
    }

    fn note_frame(&self) {
        let mut seen = self.shared.frames_seen.lock().expect("frames lock");
        *seen += 1;
        drop(seen);
        self.shared.frames_cv.notify_all();
    }

    fn dispatch_frame(&self, frame: Frame) {
        match frame.kind() {
            FrameKind::Alert => self.on_alert(),
            FrameKind::Ack => self.on_ack(),
            FrameKind::Err => self.on_err(),
            FrameKind::Data => self.on_data(frame),
        }
    }

    fn on_alert(&self) {
        debug!("PMC interrupt notification received");
        let completed_echo = {
            let mut slot = self.shared.slot.lock().expect("slot lock");
            match slot.as_mut() {
                Some(p) if p.expect == Expect::AlertEcho && p.outcome.is_none() => {
                    p.outcome = Some(Ok(None));
                    true
                }
                _ => false,
            }
        };
        if completed_echo {
            self.shared.slot_cv.notify_all();
        }
        // Every ALERT is answered with exactly one ISR read before the next
        // user command is admitted; the debt gates non-priority callers.
        {
            let mut gate = self.shared.gate.lock().expect("gate lock");
            gate.isr_debt += 1;
        }
        if self.shared.isr_tx.try_send(InterruptSignal::Alert).is_err() {
            warn!("interrupt queue full, dropping ALERT");
            self.forgive_isr_debt();
        }
    }

    fn on_ack(&self) {
        let mut completed = false;
        let mut echo_pending = false;
        {
            let mut slot = self.shared.slot.lock().expect("slot lock");
            match slot.as_mut() {
                Some(p) if p.expect == Expect::Ack && p.outcome.is_none() => {
                    p.outcome = Some(Ok(None));
                    completed = true;
                }
                Some(p) if p.expect == Expect::AlertEcho && p.outcome.is_none() => {
                    echo_pending = true;
                }
                _ => {}
            }
        }
        if completed {
            self.shared.slot_cv.notify_all();
        } else if echo_pending {
            // The echo write is acknowledged like any setter; completion
            // still waits for the interrupt round-trip.
            debug!("ACK for pending echo, awaiting ALERT");
        } else {
            warn!("unexpected ACK with no matching command, dropped");
        }
    }

    fn on_err(&self) {
        let mut completed = false;
        {
            let mut slot = self.shared.slot.lock().expect("slot lock");
            if let Some(p) = slot.as_mut() {
                if p.outcome.is_none() {
                    p.outcome = Some(Err(WdHwError::CommandRejected(p.code.clone())));
                    completed = true;
                }
            }
        }
        if completed {
            self.shared.slot_cv.notify_all();
        } else {
            warn!("unexpected ERR with no matching command, dropped");
        }
    }

    fn on_data(&self, frame: Frame) {
        let mut completed = false;
        let mut straggler: Option<String> = None;
        {
            let mut slot = self.shared.slot.lock().expect("slot lock");
            match slot.as_mut() {
                Some(p) if p.expect == Expect::Response && p.outcome.is_none() => {
                    p.outcome = Some(if p.code == frame.code {
                        Ok(frame.value)
                    } else {
                        Err(WdHwError::UnexpectedFrame {
                            sent: p.code.clone(),
                            got: frame.code,
                        })
                    });
                    completed = true;
                }
                Some(p) if p.outcome.is_none() => {
                    // A data frame cannot complete a setter or echo; leave
                    // the pending command to its own fate, log the straggler.
                    straggler = Some(format!(
                        "out-of-sequence response '{}' while awaiting {} completion",
                        frame.code, p.code
                    ));
                }
                _ => {
                    // Typically the response to a command that already
                    // timed out.
                    straggler = Some(format!(
                        "out-of-sequence response '{}' dropped",
                        frame.code
                    ));
                }
            }
        }
        if completed {
            self.shared.slot_cv.notify_all();
        } else if let Some(message) = straggler {
            warn!("{message}");
        }
    }

    // ---- interrupt thread ------------------------------------------------

    fn interrupt_loop(&self, rx: Receiver<InterruptSignal>) {
        loop {
            match rx.recv_timeout(Duration::from_millis(250)) {
                Ok(InterruptSignal::Alert) => {
                    let isr = self.priority_get_u8(registers::INTERRUPT_STATUS);
                    self.forgive_isr_debt();
                    match isr {
                        Ok(isr) => self.decode_interrupts(isr),
                        Err(e) => error!("ISR read after ALERT failed: {e}"),
                    }
                }
                Ok(InterruptSignal::Closed) => break,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if self.shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        let _ = self.shared.events_tx.try_send(PmcEvent::LinkClosed);
    }

    fn priority_get_u8(&self, code: &str) -> Result<u8> {
        let value = self
            .request(code, None, Expect::Response, COMMAND_TIMEOUT, true)?
            .ok_or_else(|| {
                WdHwError::FrameMalformed(format!("{code}: response carried no value"))
            })?;
        registers::parse_u8(code, &value)
    }

    fn forgive_isr_debt(&self) {
        let mut gate = self.shared.gate.lock().expect("gate lock");
        gate.isr_debt = gate.isr_debt.saturating_sub(1);
        drop(gate);
        self.shared.gate_cv.notify_all();
    }

    /// Decode one ISR value into events, in ascending bit order.
    fn decode_interrupts(&self, isr: u8) {
        debug!("decoding interrupt status {isr:02X}");
        let sta = if isr & (ISR_POWER_SOCKET_1 | ISR_POWER_SOCKET_2) != 0 {
            match self.priority_get_u8(registers::STATUS) {
                Ok(sta) => Some(sta),
                Err(e) => {
                    error!("STA follow-up after power interrupt failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        if isr & ISR_POWER_SOCKET_2 != 0 {
            if let Some(sta) = sta {
                self.emit(PmcEvent::PowerSupplyChanged {
                    socket: 2,
                    energized: sta & STA_POWER_SOCKET_2 != 0,
                });
            }
        }
        if isr & ISR_POWER_SOCKET_1 != 0 {
            if let Some(sta) = sta {
                self.emit(PmcEvent::PowerSupplyChanged {
                    socket: 1,
                    energized: sta & STA_POWER_SOCKET_1 != 0,
                });
            }
        }
        if isr & ISR_USB_COPY_BUTTON != 0 {
            let pressed = self.toggle_button(ISR_USB_COPY_BUTTON);
            self.emit(PmcEvent::Button {
                button: Button::UsbCopy,
                pressed,
            });
        }
        if isr & ISR_DRIVE_PRESENCE != 0 {
            match self.priority_get_u8(registers::DRIVE_PRESENCE) {
                Ok(mask) => self.emit(PmcEvent::DrivePresence { mask }),
                Err(e) => error!("DP0 follow-up after presence interrupt failed: {e}"),
            }
        }
        if isr & ISR_LCD_UP_BUTTON != 0 {
            let pressed = self.toggle_button(ISR_LCD_UP_BUTTON);
            self.emit(PmcEvent::Button {
                button: Button::LcdUp,
                pressed,
            });
        }
        if isr & ISR_LCD_DOWN_BUTTON != 0 {
            let pressed = self.toggle_button(ISR_LCD_DOWN_BUTTON);
            self.emit(PmcEvent::Button {
                button: Button::LcdDown,
                pressed,
            });
        }
        if isr & ISR_ECHO != 0 {
            debug!("echo interrupt acknowledged");
        }
    }

    /// The PMC latches button interrupts as state toggles; track press state
    /// by flipping the bit on each notification.
    fn toggle_button(&self, bit: u8) -> bool {
        let mut state = self.shared.button_state.lock().expect("button lock");
        *state ^= bit;
        *state & bit != 0
    }

    fn emit(&self, event: PmcEvent) {
        // Command-class queue: block rather than drop, the router drains it.
        if self.shared.events_tx.send(event).is_err() {
            debug!("interrupt subscriber gone, event dropped");
        }
    }

    fn mark_closed(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut slot = self.shared.slot.lock().expect("slot lock");
            if let Some(p) = slot.as_mut() {
                if p.outcome.is_none() {
                    p.outcome = Some(Err(WdHwError::LinkIo(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "PMC link closed",
                    ))));
                }
            }
        }
        self.shared.slot_cv.notify_all();
        self.shared.gate_cv.notify_all();
        self.shared.frames_cv.notify_all();
        let _ = self.shared.isr_tx.try_send(InterruptSignal::Closed);
    }
}
