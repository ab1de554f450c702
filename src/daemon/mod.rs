// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Controller runtime wiring every subsystem together.
// Author: Lukas Bower

//! Controller runtime.
//!
//! Owns the startup sequence, privilege drop, signal handling, and the
//! supervision of the long-running subsystems (temperature reader, fan
//! governor, event router, hook dispatcher, control server). A failed
//! subsystem is restarted up to three times in a sixty second window;
//! persisting failure of anything but the hook dispatcher ends the daemon
//! with the supervisor exit code.

pub mod leds;
pub mod privileges;
pub mod state;

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::events::hooks::{HookDispatcher, HookEvent, HookKind};
use crate::events::router::{EventRouter, RouterConfig, LONG_PRESS};
use crate::pmc::{link, PmcEngine, PmcEvent};
use crate::server::{HwsServer, ServerContext};
use crate::thermal::governor::{
    DutyTable, FanGovernor, GovernorConfig, ShutdownPlanner, SudoPowerOff,
};
use crate::thermal::reader::{self, SmartTool, TemperatureReader};
use state::{MachineState, SharedMachine, SharedThermal, ThermalState};

/// Clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Fatal startup error (configuration, link, privileges).
pub const EXIT_STARTUP: i32 = 1;
/// Persistent subsystem failure at runtime.
pub const EXIT_SUPERVISOR: i32 = 2;

const RESTART_LIMIT: usize = 3;
const RESTART_WINDOW: Duration = Duration::from_secs(60);
const SUPERVISOR_POLL: Duration = Duration::from_millis(250);

/// Fan duty applied when the daemon exits: decimal 48, which goes out on
/// the wire as `FAN=30`, the firmware's unattended default.
const SAFE_EXIT_FAN_PERCENT: u8 = 0x30;

static SIGNAL_SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNAL_SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only touches an atomic flag, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGQUIT, handler);
    }
}

#[derive(Default)]
struct FlagInner {
    flag: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

/// Cooperative shutdown flag shared across subsystem threads.
#[derive(Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<FlagInner>,
}

impl ShutdownFlag {
    /// A fresh, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().expect("shutdown lock");
        self.inner.cv.notify_all();
    }

    /// Whether shutdown has been requested.
    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout` or until the flag is set; returns the flag.
    /// Periodic tasks use this as their tick wait so shutdown cancels them
    /// at the next tick boundary.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let guard = self.inner.lock.lock().expect("shutdown lock");
        let _ = self
            .inner
            .cv
            .wait_timeout(guard, timeout)
            .expect("shutdown wait");
        self.is_set()
    }
}

type SubsystemResult = std::result::Result<(), String>;
type Factory = Box<dyn Fn() + Send>;

fn spawn_supervised(
    name: &'static str,
    exit_tx: Sender<(&'static str, SubsystemResult)>,
    job: Arc<dyn Fn() -> crate::error::Result<()> + Send + Sync>,
) -> Factory {
    Box::new(move || {
        let exit_tx = exit_tx.clone();
        let job = Arc::clone(&job);
        thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| job()));
                let result = match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("panicked".to_string()),
                };
                let _ = exit_tx.send((name, result));
            })
            .expect("spawn subsystem thread");
    })
}

/// The hardware controller daemon.
pub struct WdHwDaemon {
    config: Config,
    debug_mode: bool,
}

impl WdHwDaemon {
    /// Create the daemon over a loaded configuration.
    pub fn new(config: Config, debug_mode: bool) -> Self {
        WdHwDaemon { config, debug_mode }
    }

    /// Run to completion. Returns the process exit code; startup failures
    /// surface as errors and map to [`EXIT_STARTUP`] in `main`.
    pub fn run(&self) -> Result<i32> {
        let cfg = &self.config;
        let runtime_dir = Config::runtime_directory();
        if let Err(e) = fs::create_dir_all(&runtime_dir) {
            warn!("cannot create runtime directory {}: {e}", runtime_dir.display());
        }

        let user = privileges::resolve_user(&cfg.user)?;
        let gid = match &cfg.group {
            Some(group) => privileges::resolve_group(group)?,
            None => user.gid,
        };
        if privileges::effective_uid() != 0 {
            warn!("daemon expected to start as root; hardware access may be degraded");
        }

        info!("opening PMC link on {}", cfg.pmc_port);
        let (port_reader, port_writer) = link::open(&cfg.pmc_port)?;
        let (pmc, pmc_events) = PmcEngine::start(port_reader, port_writer);

        // Version read is tolerant: old BBC firmware occasionally misses
        // the very first exchange after power-up.
        let version = match pmc.version() {
            Ok(version) => {
                info!("detected PMC version {version}");
                version
            }
            Err(e) => {
                warn!("cannot read PMC version: {e}");
                String::new()
            }
        };

        pmc.enable_all_interrupts()
            .context("enabling PMC interrupts")?;
        let cfg_register = pmc.configuration().context("reading CFG")?;
        let sta = pmc.status().context("reading STA")?;
        let dp0 = pmc.drive_presence().context("reading DP0")?;
        let de0 = pmc.drive_enabled().context("reading DE0")?;
        let _backlight = pmc.backlight().context("reading BKL")?;
        let dlb = pmc.drive_alert_blink().unwrap_or(0);

        if self.debug_mode {
            self.getter_sweep(&pmc);
        }

        let chassis = state::Chassis::from_presence_mask(dp0);
        info!(
            "chassis has {} drive bays, auto bay power {}",
            chassis.bays(),
            if cfg_register & 0x01 != 0 { "on" } else { "off" }
        );
        let mut devices = reader::default_disks(chassis.bays());
        devices.extend(cfg.additional_drives.iter().cloned());

        let machine: SharedMachine = Arc::new(Mutex::new(MachineState::from_boot_registers(
            version,
            cfg_register,
            sta,
            dp0,
            de0,
            dlb,
            &devices,
        )));
        let thermal: SharedThermal = Arc::new(Mutex::new(ThermalState::new(&devices)));

        // Boot banner and LEDs are cosmetic, never fatal.
        if let Err(e) = pmc.set_lcd_text(1, "WD hardware") {
            warn!("cannot write LCD banner: {e}");
        }
        let _ = pmc.set_lcd_text(2, "daemon starting");
        let _ = pmc.set_backlight(cfg.lcd_intensity_normal);
        if let Err(e) = leds::set_boot_state(&pmc) {
            warn!("cannot set boot LED state: {e}");
        }

        let server = Arc::new(HwsServer::bind(
            &cfg.socket_path,
            cfg.socket_max_clients,
            Some((user.uid, gid)),
        )?);

        let pid_path = runtime_dir.join("wdhwd.pid");
        if let Err(e) = fs::write(&pid_path, std::process::id().to_string()) {
            warn!("cannot write PID file {}: {e}", pid_path.display());
        }

        let groups = privileges::assemble_groups(&user, gid, Path::new(&cfg.pmc_port));
        privileges::drop_privileges(&user, gid, &groups)?;

        install_signal_handlers();

        let shutdown = ShutdownFlag::new();
        let hooks = HookDispatcher::new(cfg.hook_registry());
        let planner = ShutdownPlanner::start(SudoPowerOff);

        let governor_config = GovernorConfig {
            duties: DutyTable::with_normal(cfg.fan_speed_normal),
            step_up: cfg.fan_speed_increment,
            step_down: cfg.fan_speed_decrement,
            ..GovernorConfig::default()
        };
        let router_config = RouterConfig {
            long_press: LONG_PRESS,
            dim_timeout: Duration::from_secs(cfg.lcd_dim_timeout),
            intensity_normal: cfg.lcd_intensity_normal,
            intensity_dimmed: cfg.lcd_intensity_dimmed,
            menu_cursor_path: runtime_dir.join("lcd_menu.pos"),
        };
        let server_ctx = ServerContext {
            pmc: pmc.clone(),
            thermal: Arc::clone(&thermal),
            machine: Arc::clone(&machine),
            shutdown_request: shutdown.clone(),
        };

        let (exit_tx, exit_rx) = bounded::<(&'static str, SubsystemResult)>(16);
        let subsystems = self.build_subsystems(
            &exit_tx,
            &pmc,
            pmc_events,
            &hooks,
            &planner,
            &thermal,
            &machine,
            governor_config,
            router_config,
            &server,
            server_ctx,
            &shutdown,
        );
        for (_, _, factory) in &subsystems {
            factory();
        }

        hooks.dispatch(HookEvent::plain(HookKind::SystemUp));
        if let Err(e) = leds::set_normal_state(&pmc) {
            warn!("cannot set normal LED state: {e}");
        }
        info!("startup complete");

        let exit_code = self.supervise(&subsystems, &exit_rx, &shutdown);

        // Orderly shutdown: tell the world, park the hardware in a safe
        // state, then let the subsystem threads drain at their next tick.
        info!("shutting down");
        shutdown.trigger();
        hooks.dispatch_sync(HookEvent::plain(HookKind::SystemDown));
        let _ = pmc.set_lcd_text(1, "WD hardware");
        let _ = pmc.set_lcd_text(2, "daemon offline");
        if let Err(e) = pmc.set_fan_speed(SAFE_EXIT_FAN_PERCENT) {
            warn!("cannot set exit fan speed: {e}");
        }
        let _ = leds::set_warning_state(&pmc);
        planner.stop();
        pmc.close();
        server.cleanup();
        let _ = fs::remove_file(&pid_path);
        info!("shutdown complete");
        Ok(exit_code)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_subsystems(
        &self,
        exit_tx: &Sender<(&'static str, SubsystemResult)>,
        pmc: &PmcEngine,
        pmc_events: Receiver<PmcEvent>,
        hooks: &HookDispatcher,
        planner: &ShutdownPlanner,
        thermal: &SharedThermal,
        machine: &SharedMachine,
        governor_config: GovernorConfig,
        router_config: RouterConfig,
        server: &Arc<HwsServer>,
        server_ctx: ServerContext,
        shutdown: &ShutdownFlag,
    ) -> Vec<(&'static str, bool, Factory)> {
        let mut subsystems: Vec<(&'static str, bool, Factory)> = Vec::new();

        {
            let pmc = pmc.clone();
            let thermal = Arc::clone(thermal);
            let shutdown = shutdown.clone();
            subsystems.push((
                "temperature-reader",
                true,
                spawn_supervised(
                    "temperature-reader",
                    exit_tx.clone(),
                    Arc::new(move || {
                        TemperatureReader::new(
                            pmc.clone(),
                            SmartTool::default(),
                            Arc::clone(&thermal),
                            reader::POLL_INTERVAL,
                        )
                        .run(&shutdown)
                    }),
                ),
            ));
        }
        {
            let pmc = pmc.clone();
            let thermal = Arc::clone(thermal);
            let hooks = hooks.clone();
            let planner = planner.clone();
            let shutdown = shutdown.clone();
            subsystems.push((
                "fan-governor",
                true,
                spawn_supervised(
                    "fan-governor",
                    exit_tx.clone(),
                    Arc::new(move || {
                        FanGovernor::new(
                            pmc.clone(),
                            governor_config,
                            Arc::clone(&thermal),
                            hooks.clone(),
                            planner.clone(),
                        )
                        .run(&shutdown)
                    }),
                ),
            ));
        }
        {
            let pmc = pmc.clone();
            let hooks = hooks.clone();
            let machine = Arc::clone(machine);
            let shutdown = shutdown.clone();
            subsystems.push((
                "event-router",
                true,
                spawn_supervised(
                    "event-router",
                    exit_tx.clone(),
                    Arc::new(move || {
                        EventRouter::new(
                            pmc.clone(),
                            pmc_events.clone(),
                            hooks.clone(),
                            Arc::clone(&machine),
                            router_config.clone(),
                        )
                        .run(&shutdown)
                    }),
                ),
            ));
        }
        {
            let hooks = hooks.clone();
            let shutdown = shutdown.clone();
            subsystems.push((
                "hook-dispatcher",
                false,
                spawn_supervised(
                    "hook-dispatcher",
                    exit_tx.clone(),
                    Arc::new(move || hooks.run(&shutdown)),
                ),
            ));
        }
        {
            let server = Arc::clone(server);
            let shutdown = shutdown.clone();
            subsystems.push((
                "control-server",
                true,
                spawn_supervised(
                    "control-server",
                    exit_tx.clone(),
                    Arc::new(move || server.run(server_ctx.clone(), &shutdown)),
                ),
            ));
        }
        subsystems
    }

    /// Watch subsystem exits until shutdown. Returns the exit code.
    fn supervise(
        &self,
        subsystems: &[(&'static str, bool, Factory)],
        exit_rx: &Receiver<(&'static str, SubsystemResult)>,
        shutdown: &ShutdownFlag,
    ) -> i32 {
        let mut restarts: HashMap<&'static str, VecDeque<Instant>> = HashMap::new();
        loop {
            if SIGNAL_SHUTDOWN.load(Ordering::SeqCst) {
                info!("termination signal received");
                return EXIT_OK;
            }
            if shutdown.is_set() {
                return EXIT_OK;
            }
            let (name, result) = match exit_rx.recv_timeout(SUPERVISOR_POLL) {
                Ok(exit) => exit,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return EXIT_OK,
            };
            if shutdown.is_set() {
                return EXIT_OK;
            }
            match &result {
                Ok(()) => warn!("{name} exited unexpectedly"),
                Err(e) => error!("{name} failed: {e}"),
            }

            let window = restarts.entry(name).or_default();
            let now = Instant::now();
            while window
                .front()
                .is_some_and(|t| now.duration_since(*t) >= RESTART_WINDOW)
            {
                window.pop_front();
            }
            let critical = subsystems
                .iter()
                .find(|(n, _, _)| *n == name)
                .map(|(_, critical, _)| *critical)
                .unwrap_or(true);
            if window.len() >= RESTART_LIMIT {
                if critical {
                    error!("persistent failure in {name}, giving up");
                    return EXIT_SUPERVISOR;
                }
                error!("persistent failure in {name}, leaving it stopped");
                continue;
            }
            window.push_back(now);
            warn!("restarting {name}");
            if let Some((_, _, factory)) = subsystems.iter().find(|(n, _, _)| *n == name) {
                factory();
            }
        }
    }

    /// Debug mode: exercise every getter once and log the values.
    fn getter_sweep(&self, pmc: &PmcEngine) {
        debug!("debug mode: executing all getter commands");
        let reads: [(&str, crate::error::Result<String>); 9] = [
            ("CFG", pmc.configuration().map(|v| format!("{v:02X}"))),
            ("TMP", pmc.temperature().map(|v| v.to_string())),
            ("LED", pmc.led_status().map(|v| format!("{v:02X}"))),
            ("BLK", pmc.led_blink().map(|v| format!("{v:02X}"))),
            ("BKL", pmc.backlight().map(|v| v.to_string())),
            ("RPM", pmc.fan_rpm().map(|v| v.to_string())),
            ("TAC", pmc.fan_tacho().map(|v| v.to_string())),
            ("FAN", pmc.fan_speed().map(|v| v.to_string())),
            ("DLB", pmc.drive_alert_blink().map(|v| format!("{v:02X}"))),
        ];
        for (code, outcome) in reads {
            match outcome {
                Ok(value) => debug!("{code} = {value}"),
                Err(e) => warn!("{code} read failed: {e}"),
            }
        }
    }
}
