// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Driver backends for the pipeline manager.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use slog::o;

use aal::DalOps;
use aal::DalResult;

pub mod chaos;
pub mod stub;

/// Selects the driver backing a device.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DriverConfig {
    /// Keep entries in memory, never fail
    #[default]
    Stub,
    /// Keep entries in memory, fail at random
    Chaos(chaos::ChaosConfig),
}

impl std::fmt::Display for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DriverConfig::Stub => write!(f, "stub"),
            DriverConfig::Chaos(_) => write!(f, "chaos"),
        }
    }
}

/// Instantiate the driver described by `config`.
pub fn new_driver(
    log: &slog::Logger,
    config: &DriverConfig,
) -> DalResult<Arc<dyn DalOps>> {
    let log = log.new(o!("driver" => config.to_string()));
    Ok(match config {
        DriverConfig::Stub => Arc::new(stub::StubDal::new(&log)),
        DriverConfig::Chaos(c) => Arc::new(chaos::ChaosDal::new(&log, c)?),
    })
}

#[cfg(test)]
pub(crate) fn test_logger() -> slog::Logger {
    common::logging::init("test", &None, common::logging::LogFormat::Human)
        .unwrap()
}
