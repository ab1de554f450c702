// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Thermal monitoring and fan control.
// Author: Lukas Bower

//! Thermal subsystem: temperature acquisition and the fan governor.

pub mod governor;
pub mod reader;

/// Discrete thermal alert bands, coldest to hottest.
///
/// The ordering is load-bearing: the governor compares levels to stage its
/// responses, and `Shutdown`/`Critical` trigger the power-off paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlertLevel {
    /// Implausibly cold; usually a sensor fault.
    Under,
    /// Below the normal operating band.
    Cool,
    /// Normal operating band.
    Normal,
    /// Elevated but harmless.
    Warm,
    /// Hot; fan at full speed.
    Hot,
    /// Dangerously hot.
    Danger,
    /// Hot enough to schedule a graceful power-off.
    Shutdown,
    /// Immediate power-off territory.
    Critical,
}

impl AlertLevel {
    /// All levels, coldest first.
    pub const ALL: [AlertLevel; 8] = [
        AlertLevel::Under,
        AlertLevel::Cool,
        AlertLevel::Normal,
        AlertLevel::Warm,
        AlertLevel::Hot,
        AlertLevel::Danger,
        AlertLevel::Shutdown,
        AlertLevel::Critical,
    ];

    /// Stable name used in logs and hook placeholders.
    pub fn name(self) -> &'static str {
        match self {
            AlertLevel::Under => "under",
            AlertLevel::Cool => "cool",
            AlertLevel::Normal => "normal",
            AlertLevel::Warm => "warm",
            AlertLevel::Hot => "hot",
            AlertLevel::Danger => "danger",
            AlertLevel::Shutdown => "shutdown",
            AlertLevel::Critical => "critical",
        }
    }

    /// Index into threshold and duty tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The next colder level, saturating at `Under`.
    pub fn cooler(self) -> AlertLevel {
        match self {
            AlertLevel::Under | AlertLevel::Cool => AlertLevel::Under,
            other => AlertLevel::ALL[other.index() - 1],
        }
    }
}
