// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Error taxonomy shared across the hardware controller daemon.
// Author: Lukas Bower

//! Error types for the hardware controller daemon.

use std::io;

use thiserror::Error;

/// Errors produced by the daemon's subsystems.
#[derive(Debug, Error)]
pub enum WdHwError {
    /// The configuration file could not be parsed or contains invalid values.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// The serial link to the PMC failed.
    #[error("PMC link I/O error: {0}")]
    LinkIo(#[from] io::Error),
    /// A frame received from the PMC could not be decoded.
    #[error("malformed PMC frame: {0}")]
    FrameMalformed(String),
    /// The PMC refused a command with an `ERR` frame.
    #[error("command {0} rejected by PMC")]
    CommandRejected(String),
    /// No response arrived before the per-request deadline.
    #[error("command {0} timed out")]
    Timeout(String),
    /// A response frame did not match the outstanding request.
    #[error("unexpected PMC response '{got}' to command {sent}")]
    UnexpectedFrame {
        /// Code of the command that was outstanding.
        sent: String,
        /// Code of the frame that actually arrived.
        got: String,
    },
    /// The register is not part of the supported command set.
    #[error("register {0} is not supported")]
    Unsupported(String),
    /// A notification hook or external tool failed to run.
    #[error("subprocess {command} failed: {reason}")]
    SubprocessFailed {
        /// The command that was invoked.
        command: String,
        /// Failure description.
        reason: String,
    },
    /// A control-socket client sent a request the server cannot parse.
    #[error("malformed request: {0}")]
    IpcMalformedRequest(String),
    /// The chassis reached a temperature that forces a power-off.
    #[error("thermal condition critical, shutting down")]
    ThermalCritical,
}

impl WdHwError {
    /// Whether the protocol engine may transparently retry the request once
    /// after draining the line.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WdHwError::LinkIo(_)
                | WdHwError::FrameMalformed(_)
                | WdHwError::UnexpectedFrame { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WdHwError>;
