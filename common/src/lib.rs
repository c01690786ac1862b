// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Definitions shared by the pipeline manager, its drivers, and the admin
//! tooling.

pub mod logging;
pub mod ports;

/// Maximum number of concurrently open client sessions, absent any explicit
/// configuration.
pub const DEFAULT_MAX_SESSIONS: usize = 16;

/// Pipe identifier used in a device target to address every pipeline replica
/// of a table at once.
pub const DEV_PIPE_ALL: u16 = 0xffff;
