// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Externs are the stateful objects a program declares outside of its tables.
//! Counters are the only kind currently supported.

use aal::CounterData;
use slog::debug;

use crate::context::CounterType;
use crate::context::ExternContext;
use crate::context::ExternKind;
use crate::profile::Pipeline;
use crate::types::*;

impl Pipeline {
    /// Find an extern by its full name or its target name
    pub fn extern_ctx(&self, name: &str) -> PipeMgrResult<&ExternContext> {
        self.externs
            .get(name)
            .or_else(|| self.externs.values().find(|e| e.target_name == name))
            .ok_or_else(|| PipeMgrError::NotFound(format!("extern {name}")))
    }

    // Resolve a counter cell, returning the counter's full name and type.
    fn counter_cell(
        &self,
        name: &str,
        index: u32,
    ) -> PipeMgrResult<(&str, CounterType)> {
        let ext = self.extern_ctx(name)?;
        let ExternKind::Counter { counter_type, size } = ext.kind;
        if index >= size {
            return Err(PipeMgrError::Invalid(format!(
                "index {index} out of range for {} (size {size})",
                ext.name
            )));
        }
        Ok((&ext.name, counter_type))
    }

    /// Read one cell of a counter.  Only the quantities the counter is
    /// declared to track are reported.
    pub fn counter_read(
        &self,
        name: &str,
        index: u32,
    ) -> PipeMgrResult<CounterData> {
        let (name, counter_type) = self.counter_cell(name, index)?;
        let data = self.driver.counter_get(name, index)?;
        Ok(match counter_type {
            CounterType::Packets => CounterData {
                pkts: data.pkts,
                bytes: None,
            },
            CounterType::Bytes => CounterData {
                pkts: None,
                bytes: data.bytes,
            },
            CounterType::PacketsAndBytes => data,
        })
    }

    pub fn counter_clear(&self, name: &str, index: u32) -> PipeMgrResult<()> {
        let (name, _) = self.counter_cell(name, index)?;
        self.driver.counter_clear(name, index)?;
        debug!(self.log, "cleared counter {name}[{index}]");
        Ok(())
    }
}
