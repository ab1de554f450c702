// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Parse the control socket's line protocol.
// Author: Lukas Bower

//! Control socket request grammar.
//!
//! One newline-terminated request per connection, one response line back.
//! Getter requests are a bare keyword; setters carry their arguments after
//! the keyword. The two LCD lines of `lcd set` are separated by a tab so
//! either may contain spaces.

use crate::error::{Result, WdHwError};

/// A parsed control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// PMC firmware version.
    Version,
    /// Board and disk temperatures.
    Temperature,
    /// Fan duty, target, and RPM.
    Fan,
    /// Per-bay presence/power/alert state.
    Drives,
    /// Per-socket power state.
    Power,
    /// Write both LCD text lines.
    LcdSet {
        /// First panel line.
        line1: String,
        /// Second panel line.
        line2: String,
    },
    /// Set the LCD backlight intensity.
    LcdBacklight(u8),
    /// Set the steady LED bitmap.
    Led(u8),
    /// Request an orderly daemon shutdown.
    Shutdown,
}

impl Request {
    /// Parse one request line.
    pub fn parse(line: &str) -> Result<Request> {
        let line = line.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim();
        match trimmed {
            "version" => return Ok(Request::Version),
            "temperature" => return Ok(Request::Temperature),
            "fan" => return Ok(Request::Fan),
            "drives" => return Ok(Request::Drives),
            "power" => return Ok(Request::Power),
            "shutdown" => return Ok(Request::Shutdown),
            _ => {}
        }
        if let Some(rest) = trimmed.strip_prefix("lcd set ") {
            let (line1, line2) = match rest.split_once('\t') {
                Some((line1, line2)) => (line1, line2),
                None => (rest, ""),
            };
            return Ok(Request::LcdSet {
                line1: line1.to_string(),
                line2: line2.to_string(),
            });
        }
        if let Some(rest) = trimmed.strip_prefix("lcd backlight ") {
            let percent: u8 = rest
                .trim()
                .parse()
                .map_err(|_| WdHwError::IpcMalformedRequest(format!("bad percentage '{rest}'")))?;
            if percent > 100 {
                return Err(WdHwError::IpcMalformedRequest(format!(
                    "backlight {percent} out of range"
                )));
            }
            return Ok(Request::LcdBacklight(percent));
        }
        if let Some(rest) = trimmed.strip_prefix("led ") {
            let mask = u8::from_str_radix(rest.trim(), 16)
                .map_err(|_| WdHwError::IpcMalformedRequest(format!("bad LED bitmask '{rest}'")))?;
            return Ok(Request::Led(mask));
        }
        Err(WdHwError::IpcMalformedRequest(format!(
            "unknown request '{trimmed}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_keywords_parse() {
        assert_eq!(Request::parse("version\n").expect("parse"), Request::Version);
        assert_eq!(Request::parse("  power  ").expect("parse"), Request::Power);
        assert_eq!(Request::parse("shutdown").expect("parse"), Request::Shutdown);
    }

    #[test]
    fn lcd_set_splits_lines_on_tab() {
        let request = Request::parse("lcd set IP:\taddr 10.0.0.1\n").expect("parse");
        assert_eq!(
            request,
            Request::LcdSet {
                line1: "IP:".to_string(),
                line2: "addr 10.0.0.1".to_string(),
            }
        );
    }

    #[test]
    fn lcd_set_tolerates_a_single_line() {
        let request = Request::parse("lcd set hello world").expect("parse");
        assert_eq!(
            request,
            Request::LcdSet {
                line1: "hello world".to_string(),
                line2: String::new(),
            }
        );
    }

    #[test]
    fn backlight_requires_a_percentage() {
        assert_eq!(
            Request::parse("lcd backlight 80").expect("parse"),
            Request::LcdBacklight(80)
        );
        assert!(Request::parse("lcd backlight 130").is_err());
        assert!(Request::parse("lcd backlight eleven").is_err());
    }

    #[test]
    fn led_takes_a_hex_bitmask() {
        assert_eq!(Request::parse("led 1b").expect("parse"), Request::Led(0x1B));
        assert!(Request::parse("led zz").is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Request::parse("make me a sandwich").is_err());
        assert!(Request::parse("").is_err());
    }
}
