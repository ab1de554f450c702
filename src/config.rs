// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Typed daemon configuration loaded once at startup.
// Author: Lukas Bower

//! Daemon configuration.
//!
//! A single TOML file, read once at startup and immutable afterwards.
//! Unrecognized keys are rejected rather than silently ignored; a missing
//! file yields the defaults with a warning so a bare appliance still gets
//! sane thermal behaviour.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{warn, LevelFilter};
use serde::Deserialize;

use crate::error::{Result, WdHwError};
use crate::events::hooks::HookKind;

/// Default configuration file location.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/wdhwd/wdhwd.conf";

/// Default control socket location.
pub const DEFAULT_SOCKET_PATH: &str = "/run/wdhwd/hws.sock";

/// A notification hook: a command plus its argument template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCommand {
    /// Program to execute.
    pub command: String,
    /// Argument templates; `{placeholder}` markers are substituted per event.
    pub args: Vec<String>,
}

/// Parsed daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// User to drop privileges to.
    pub user: String,
    /// Optional group to drop privileges to (defaults to the user's group).
    pub group: Option<String>,
    /// Serial port the PMC is attached to.
    pub pmc_port: String,
    /// Path of the control socket.
    pub socket_path: PathBuf,
    /// Maximum concurrently served control-socket clients.
    pub socket_max_clients: usize,
    /// Optional log file; console logging is always available.
    pub log_file: Option<PathBuf>,
    /// Log verbosity for the log file and as a floor for the console.
    pub logging: String,
    /// LCD backlight intensity while the panel is active, percent.
    pub lcd_intensity_normal: u8,
    /// LCD backlight intensity after the dim timeout, percent.
    pub lcd_intensity_dimmed: u8,
    /// Seconds of button inactivity before the backlight dims.
    pub lcd_dim_timeout: u64,
    /// Fan duty cycle for the normal thermal band, percent.
    pub fan_speed_normal: u8,
    /// Duty-cycle step when ramping the fan up, percent.
    pub fan_speed_increment: u8,
    /// Duty-cycle step when ramping the fan down, percent.
    pub fan_speed_decrement: u8,
    /// Disk devices monitored in addition to the chassis defaults.
    pub additional_drives: Vec<String>,

    pub system_up_command: Option<String>,
    pub system_up_args: Vec<String>,
    pub system_down_command: Option<String>,
    pub system_down_args: Vec<String>,
    pub drive_presence_changed_command: Option<String>,
    pub drive_presence_changed_args: Vec<String>,
    pub power_supply_changed_command: Option<String>,
    pub power_supply_changed_args: Vec<String>,
    pub temperature_changed_command: Option<String>,
    pub temperature_changed_args: Vec<String>,
    pub usb_copy_button_command: Option<String>,
    pub usb_copy_button_args: Vec<String>,
    pub usb_copy_button_long_command: Option<String>,
    pub usb_copy_button_long_args: Vec<String>,
    pub lcd_up_button_command: Option<String>,
    pub lcd_up_button_args: Vec<String>,
    pub lcd_up_button_long_command: Option<String>,
    pub lcd_up_button_long_args: Vec<String>,
    pub lcd_down_button_command: Option<String>,
    pub lcd_down_button_args: Vec<String>,
    pub lcd_down_button_long_command: Option<String>,
    pub lcd_down_button_long_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: "wdhwd".into(),
            group: None,
            pmc_port: crate::pmc::link::DEFAULT_PORT.into(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_max_clients: 10,
            log_file: None,
            logging: "warning".into(),
            lcd_intensity_normal: 60,
            lcd_intensity_dimmed: 0,
            lcd_dim_timeout: 60,
            fan_speed_normal: 30,
            fan_speed_increment: 10,
            fan_speed_decrement: 10,
            additional_drives: Vec::new(),
            system_up_command: None,
            system_up_args: Vec::new(),
            system_down_command: None,
            system_down_args: Vec::new(),
            drive_presence_changed_command: None,
            drive_presence_changed_args: vec![
                "{drive_bay}".into(),
                "{drive_name}".into(),
                "{state}".into(),
            ],
            power_supply_changed_command: None,
            power_supply_changed_args: vec!["{socket}".into(), "{state}".into()],
            temperature_changed_command: None,
            temperature_changed_args: vec!["{new_level}".into(), "{old_level}".into()],
            usb_copy_button_command: None,
            usb_copy_button_args: Vec::new(),
            usb_copy_button_long_command: None,
            usb_copy_button_long_args: Vec::new(),
            lcd_up_button_command: None,
            lcd_up_button_args: Vec::new(),
            lcd_up_button_long_command: None,
            lcd_up_button_long_args: Vec::new(),
            lcd_down_button_command: None,
            lcd_down_button_args: Vec::new(),
            lcd_down_button_long_command: None,
            lcd_down_button_long_args: Vec::new(),
        }
    }
}

impl Config {
    /// Load the configuration from `path`.
    ///
    /// A missing file is tolerated (defaults apply); a present but invalid
    /// file is a startup error.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("configuration file {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(WdHwError::ConfigInvalid(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        let config: Config = toml::from_str(&raw)
            .map_err(|e| WdHwError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(WdHwError::ConfigInvalid("user must not be empty".into()));
        }
        if self.socket_max_clients == 0 {
            return Err(WdHwError::ConfigInvalid(
                "socket_max_clients must be at least 1".into(),
            ));
        }
        if self.fan_speed_increment == 0 || self.fan_speed_decrement == 0 {
            return Err(WdHwError::ConfigInvalid(
                "fan speed steps must be non-zero".into(),
            ));
        }
        for (key, value) in [
            ("lcd_intensity_normal", self.lcd_intensity_normal),
            ("lcd_intensity_dimmed", self.lcd_intensity_dimmed),
            ("fan_speed_normal", self.fan_speed_normal),
        ] {
            if value > 100 {
                return Err(WdHwError::ConfigInvalid(format!(
                    "{key} must be a percentage (got {value})"
                )));
            }
        }
        self.log_level()?;
        Ok(())
    }

    /// Parse the `logging` option into a level filter.
    pub fn log_level(&self) -> Result<LevelFilter> {
        match self.logging.to_ascii_lowercase().as_str() {
            "critical" | "crit" | "c" | "error" | "err" | "e" => Ok(LevelFilter::Error),
            "warning" | "warn" | "w" => Ok(LevelFilter::Warn),
            "info" | "inf" | "i" => Ok(LevelFilter::Info),
            "debug" | "dbg" | "deb" | "d" => Ok(LevelFilter::Debug),
            "all" | "any" | "a" | "trace" => Ok(LevelFilter::Trace),
            "none" | "no" | "n" | "off" => Ok(LevelFilter::Off),
            other => Err(WdHwError::ConfigInvalid(format!(
                "'{other}' is not a valid log level"
            ))),
        }
    }

    /// Assemble the notification hook registry.
    pub fn hook_registry(&self) -> HashMap<HookKind, HookCommand> {
        let mut registry = HashMap::new();
        let entries: [(HookKind, &Option<String>, &Vec<String>); 11] = [
            (HookKind::SystemUp, &self.system_up_command, &self.system_up_args),
            (HookKind::SystemDown, &self.system_down_command, &self.system_down_args),
            (
                HookKind::DrivePresenceChanged,
                &self.drive_presence_changed_command,
                &self.drive_presence_changed_args,
            ),
            (
                HookKind::PowerSupplyChanged,
                &self.power_supply_changed_command,
                &self.power_supply_changed_args,
            ),
            (
                HookKind::TemperatureChanged,
                &self.temperature_changed_command,
                &self.temperature_changed_args,
            ),
            (HookKind::UsbCopyButton, &self.usb_copy_button_command, &self.usb_copy_button_args),
            (
                HookKind::UsbCopyButtonLong,
                &self.usb_copy_button_long_command,
                &self.usb_copy_button_long_args,
            ),
            (HookKind::LcdUpButton, &self.lcd_up_button_command, &self.lcd_up_button_args),
            (
                HookKind::LcdUpButtonLong,
                &self.lcd_up_button_long_command,
                &self.lcd_up_button_long_args,
            ),
            (HookKind::LcdDownButton, &self.lcd_down_button_command, &self.lcd_down_button_args),
            (
                HookKind::LcdDownButtonLong,
                &self.lcd_down_button_long_command,
                &self.lcd_down_button_long_args,
            ),
        ];
        for (kind, command, args) in entries {
            if let Some(command) = command {
                registry.insert(
                    kind,
                    HookCommand {
                        command: command.clone(),
                        args: args.clone(),
                    },
                );
            }
        }
        registry
    }

    /// Runtime directory for volatile state (PID file, LCD menu cursor).
    ///
    /// `RUNTIME_DIRECTORY` is the only environment variable the daemon
    /// consumes; systemd populates it when `RuntimeDirectory=` is set.
    pub fn runtime_directory() -> PathBuf {
        std::env::var_os("RUNTIME_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/run/wdhwd"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.log_level().expect("level"), LevelFilter::Warn);
    }

    #[test]
    fn parses_a_full_file() {
        let config: Config = toml::from_str(
            r#"
            user = "wdhwd"
            pmc_port = "/dev/ttyUSB0"
            socket_max_clients = 4
            logging = "debug"
            fan_speed_normal = 40
            additional_drives = ["/dev/sdc"]
            temperature_changed_command = "/usr/share/wdhwd/temp_changed.sh"
            "#,
        )
        .expect("parse");
        assert_eq!(config.pmc_port, "/dev/ttyUSB0");
        assert_eq!(config.socket_max_clients, 4);
        assert_eq!(config.additional_drives, vec!["/dev/sdc".to_string()]);
        let registry = config.hook_registry();
        assert_eq!(registry.len(), 1);
        let hook = registry.get(&HookKind::TemperatureChanged).expect("hook");
        assert_eq!(hook.args, vec!["{new_level}", "{old_level}"]);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<Config>("frobnicate = 1").is_err());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.lcd_intensity_normal = 130;
        assert!(config.validate().is_err());
        let mut config = Config::default();
        config.logging = "loud".into();
        assert!(config.validate().is_err());
    }
}
