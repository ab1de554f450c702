// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Hardware controller library for WD My Cloud NAS appliances.
// Author: Lukas Bower

//! Hardware controller for Western Digital My Cloud NAS appliances
//! (DL2100, DL4100, PR2100, PR4100).
//!
//! These boxes route the chassis fan, enclosure LEDs, front-panel LCD,
//! drive-bay power rails and front-panel buttons through a dedicated
//! microcontroller (the PMC) spoken to over a 9600-8N1 UART. This crate
//! owns that link and turns it into a daemon: a serialized protocol engine
//! with asynchronous interrupt handling, a hysteretic fan governor wired to
//! board and disk temperatures, drive-bay and power-supply tracking,
//! user-configurable notification hooks, and a local Unix-socket control
//! surface.

/// Daemon configuration.
pub mod config;
/// Controller runtime, supervision, privileges, shared state.
pub mod daemon;
/// Error taxonomy.
pub mod error;
/// Event routing and notification hooks.
pub mod events;
/// PMC serial protocol stack.
pub mod pmc;
/// Local control socket server.
pub mod server;
/// Temperature acquisition and fan governor.
pub mod thermal;

pub use config::Config;
pub use daemon::WdHwDaemon;
pub use error::{Result, WdHwError};
