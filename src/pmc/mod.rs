// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: PMC serial protocol surface.
// Author: Lukas Bower

//! Serial protocol stack for the Western Digital PMC microcontroller.
//!
//! `frame` handles the carriage-return line coding, `registers` describes
//! the closed command set, `link` owns the UART, and `engine` multiplexes
//! solicited responses and unsolicited interrupts over the half-duplex
//! line.

pub mod engine;
pub mod frame;
pub mod link;
pub mod registers;

pub use engine::{Button, PmcEngine, PmcEvent};
