// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Event routing and notification hooks.
// Author: Lukas Bower

//! Event handling: routing decoded PMC interrupts and launching hooks.

pub mod hooks;
pub mod router;
