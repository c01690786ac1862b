// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use schemars::JsonSchema;
use semver::Version;
use serde::Deserialize;
use serde::Serialize;
use slog::{debug, info, o};

use aal::DalOps;
use aal::TableType;

use crate::context::ExternContext;
use crate::context::PipelineContext;
use crate::context::TableContext;
use crate::table::adt::AdtEntry;
use crate::table::mat::MatEntry;
use crate::table::sel::SelGroup;
use crate::table::value_lookup::VlEntry;
use crate::table::Table;
use crate::types::*;

/// The most connection-tracking timer profiles a pipeline may define
pub const MAX_CT_TIMER_PROFILES: usize = 8;

/// Where mirrored packets are sent, and how much of each is kept
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct MirrorProfile {
    pub session_id: u16,
    pub port_id: u32,
    /// Truncate mirrored packets to this many bytes.  0 keeps the packet
    /// intact.
    #[serde(default)]
    pub truncate_length: u16,
    #[serde(default)]
    pub fast_clone: bool,
}

/// The tables and externs of one loaded pipeline.  Every entry operation is a
/// method on this struct, reached through the owning [`Profile`]'s lock.
pub struct Pipeline {
    pub(crate) log: slog::Logger,
    pub(crate) driver: Arc<dyn DalOps>,
    pub(crate) context: PipelineContext,
    pub(crate) mats: BTreeMap<TableHdl, Table<MatEntry>>,
    pub(crate) adts: BTreeMap<TableHdl, Table<AdtEntry>>,
    pub(crate) sels: BTreeMap<TableHdl, Table<SelGroup>>,
    pub(crate) vls: BTreeMap<TableHdl, Table<VlEntry>>,
    pub(crate) externs: BTreeMap<String, ExternContext>,
}

impl Pipeline {
    /// Build the runtime state for every table in `context`, registering each
    /// table with the driver.
    pub fn new(
        log: &slog::Logger,
        driver: Arc<dyn DalOps>,
        context: PipelineContext,
        num_pipes: u16,
    ) -> PipeMgrResult<Self> {
        if num_pipes == 0 {
            return Err(PipeMgrError::Invalid(
                "a pipeline needs at least one replica".into(),
            ));
        }
        let log = log.new(o!("pipeline" => context.program_name.clone()));
        let mut p = Pipeline {
            log,
            driver,
            context: context.clone(),
            mats: BTreeMap::new(),
            adts: BTreeMap::new(),
            sels: BTreeMap::new(),
            vls: BTreeMap::new(),
            externs: context
                .externs
                .iter()
                .map(|e| (e.name.clone(), e.clone()))
                .collect(),
        };

        for ctx in &context.tables {
            p.driver.table_init(&ctx.dal_table())?;
            let hdl = ctx.handle;
            let ctx = ctx.clone();
            match ctx.table_type {
                TableType::Match => {
                    p.mats.insert(hdl, Table::new(&p.log, ctx, num_pipes));
                }
                TableType::Action => {
                    p.adts.insert(hdl, Table::new(&p.log, ctx, num_pipes));
                }
                TableType::Selection => {
                    p.sels.insert(hdl, Table::new(&p.log, ctx, num_pipes));
                }
                TableType::ValueLookup => {
                    p.vls.insert(hdl, Table::new(&p.log, ctx, num_pipes));
                }
            }
        }
        debug!(p.log, "pipeline ready";
            "tables" => context.tables.len(),
            "externs" => context.externs.len());
        Ok(p)
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn table_hdl(&self, name: &str) -> PipeMgrResult<TableHdl> {
        self.context
            .table(name)
            .map(|t| t.handle)
            .ok_or_else(|| PipeMgrError::NoSuchTable(name.to_string()))
    }

    pub fn table_ctx(
        &self,
        tbl_hdl: TableHdl,
    ) -> PipeMgrResult<&Arc<TableContext>> {
        self.context
            .table_by_hdl(tbl_hdl)
            .ok_or_else(|| PipeMgrError::NoSuchTable(format!("{tbl_hdl}")))
    }
}

// Look up a table of one specific kind
macro_rules! table_lookup {
    ($name:ident, $map:ident, $entry:ty, $kind:expr) => {
        impl Pipeline {
            pub(crate) fn $name(
                &self,
                tbl_hdl: TableHdl,
            ) -> PipeMgrResult<&Table<$entry>> {
                self.$map.get(&tbl_hdl).ok_or_else(|| {
                    PipeMgrError::NoSuchTable(format!(
                        "{tbl_hdl} is not {}",
                        $kind
                    ))
                })
            }
        }
    };
}

table_lookup!(mat, mats, MatEntry, "a match table");
table_lookup!(adt, adts, AdtEntry, "an action data table");
table_lookup!(sel, sels, SelGroup, "a selector table");
table_lookup!(vl, vls, VlEntry, "a value lookup table");

/// One compiled program instance bound to a device
pub struct Profile {
    pub id: u32,
    pub prog_name: String,
    pub pipeline_name: String,
    pub core_id: u32,
    /// Mirrored packets are cloned by the fast path
    pub fast_clone: bool,
    /// The binary configuration this profile was built from.  Kept only to
    /// report where the profile came from.
    pub cfg_file: Option<PathBuf>,
    pub compiler_version: Version,
    pub schema_version: Version,
    pub mirror_profiles: Vec<MirrorProfile>,
    /// Connection-tracking timeouts, in seconds
    pub ct_timeouts: Vec<u32>,
    pub(crate) pipeline: RwLock<Pipeline>,
}

impl Profile {
    pub fn new(
        log: &slog::Logger,
        id: u32,
        pipeline_name: impl ToString,
        context: PipelineContext,
        driver: Arc<dyn DalOps>,
        num_pipes: u16,
    ) -> PipeMgrResult<Self> {
        let pipeline_name = pipeline_name.to_string();
        let log = log.new(o!(
            "unit" => "profile",
            "profile" => id,
            "pipeline_name" => pipeline_name.clone()
        ));
        info!(log, "loading profile";
            "program" => &context.program_name,
            "compiler_version" => context.compiler_version.to_string(),
            "schema_version" => context.schema_version.to_string());

        Ok(Profile {
            id,
            prog_name: context.program_name.clone(),
            pipeline_name,
            core_id: 0,
            fast_clone: false,
            cfg_file: None,
            compiler_version: context.compiler_version.clone(),
            schema_version: context.schema_version.clone(),
            mirror_profiles: Vec::new(),
            ct_timeouts: Vec::new(),
            pipeline: RwLock::new(Pipeline::new(
                &log, driver, context, num_pipes,
            )?),
        })
    }

    pub fn set_ct_timeouts(&mut self, timeouts: Vec<u32>) -> PipeMgrResult<()> {
        if timeouts.len() > MAX_CT_TIMER_PROFILES {
            return Err(PipeMgrError::Invalid(format!(
                "{} connection-tracking timeouts, at most {} allowed",
                timeouts.len(),
                MAX_CT_TIMER_PROFILES
            )));
        }
        self.ct_timeouts = timeouts;
        Ok(())
    }

    /// The mirror profile for a session, if one is configured
    pub fn mirror_profile(&self, session_id: u16) -> Option<&MirrorProfile> {
        self.mirror_profiles
            .iter()
            .find(|m| m.session_id == session_id)
    }

    /// Run `f` with shared access to the pipeline.  Entry operations only need
    /// this; they serialize against each other on the table locks.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Pipeline) -> PipeMgrResult<T>,
    ) -> PipeMgrResult<T> {
        f(&self.pipeline.read())
    }

    /// Run `f` with exclusive access to the pipeline.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut Pipeline) -> PipeMgrResult<T>,
    ) -> PipeMgrResult<T> {
        f(&mut self.pipeline.write())
    }
}
