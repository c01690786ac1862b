// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! The driver abstraction layer.  The pipeline manager owns all of the table
//! bookkeeping, and hands each entry to a driver implementing [`DalOps`] to be
//! programmed into the target.  Whatever per-entry state the driver needs is
//! returned as an opaque [`DalData`] token, which the pipeline manager stores
//! alongside the entry and passes back on every later operation.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod match_action;
pub use match_action::*;

/// A specialized Result type for driver operations
pub type DalResult<T> = Result<T, DalError>;

/// Error type conveying additional information about driver errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DalError {
    /// An argument passed to the driver layer is invalid or inappropriate.
    /// This indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// A driver function was called before the table or device was
    /// initialized.  Indicates misbehavior from the caller.
    #[error("Driver uninitialized: {}", .0)]
    Uninitialized(String),
    /// This operation is unsupported by the driver being used
    #[error("Operation unsupported by the driver")]
    OperationUnsupported,
    /// The driver layer detected some internal inconsistency
    #[error("Internal error: {}", .0)]
    Internal(String),
    /// An error derived from a purposely triggered synthetic fault for testing
    /// purposes.
    #[error("Synthetic driver error: {}", .0)]
    Synthetic(String),
    /// A general indication that a caller is trying to create something that
    /// already exists.
    #[error("Already exists")]
    Exists,
    /// A general indication that a caller is trying to modify something that
    /// is not present.
    #[error("Missing: {}", .0)]
    Missing(String),
}

/// Opaque per-entry state owned by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DalData(pub u64);

/// The kinds of table a compiled pipeline can contain
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TableType {
    /// Match-action table
    Match,
    /// Action-data table
    Action,
    /// Selector table
    Selection,
    ValueLookup,
}

/// What the driver needs to know about a table to program it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DalTable {
    pub handle: u32,
    pub name: String,
    pub target_name: String,
    pub table_type: TableType,
    pub size: u32,
}

/// Which pipeline replicas of a table an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipeTarget {
    All,
    Pipe(u16),
}

impl From<u16> for PipeTarget {
    fn from(pipe_id: u16) -> Self {
        if pipe_id == common::DEV_PIPE_ALL {
            PipeTarget::All
        } else {
            PipeTarget::Pipe(pipe_id)
        }
    }
}

impl std::fmt::Display for PipeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PipeTarget::All => write!(f, "all"),
            PipeTarget::Pipe(p) => write!(f, "{p}"),
        }
    }
}

/// The action half of a match-action entry, as handed to a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DalAction {
    /// An action with its parameters packed inline
    Direct { act_fn_hdl: u32, data: Vec<u8> },
    /// A reference to a shared action-data member
    Member(u32),
    /// A reference to a selector group
    Group(u32),
}

/// A single entry, as handed to a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DalEntry {
    Match {
        key: MatchSpec,
        action: DalAction,
    },
    ActionData {
        mbr_id: u32,
        act_fn_hdl: u32,
        data: Vec<u8>,
    },
    Value {
        key: MatchSpec,
        data: Vec<u8>,
    },
}

/// The `DalOps` trait defines the operations a driver is expected to provide
/// for the tables and externs of a loaded pipeline.  The caller has already
/// validated every entry against the compiled context, and guarantees that
/// operations on a single table are serialized.
pub trait DalOps: Send + Sync {
    /// Prepare the driver to accept entries for a table.
    fn table_init(&self, table: &DalTable) -> DalResult<()>;

    /// Remove every entry, member, and group from a table.
    fn table_clear(&self, table: &DalTable) -> DalResult<()>;

    fn entry_add(
        &self,
        table: &DalTable,
        target: PipeTarget,
        entry: &DalEntry,
    ) -> DalResult<DalData>;

    fn entry_update(
        &self,
        table: &DalTable,
        target: PipeTarget,
        data: &DalData,
        entry: &DalEntry,
    ) -> DalResult<()>;

    fn entry_del(
        &self,
        table: &DalTable,
        target: PipeTarget,
        data: &DalData,
    ) -> DalResult<()>;

    /// Delete an entry the pipeline manager never stored, identified only by
    /// its match key.
    fn entry_del_by_key(
        &self,
        table: &DalTable,
        target: PipeTarget,
        key: &MatchSpec,
    ) -> DalResult<()>;

    fn group_add(
        &self,
        table: &DalTable,
        target: PipeTarget,
        grp_id: u32,
        max_grp_size: u32,
    ) -> DalResult<DalData>;

    fn group_del(
        &self,
        table: &DalTable,
        target: PipeTarget,
        grp: &DalData,
    ) -> DalResult<()>;

    fn group_member_add(
        &self,
        table: &DalTable,
        target: PipeTarget,
        grp: &DalData,
        mbr_id: u32,
    ) -> DalResult<()>;

    fn group_member_del(
        &self,
        table: &DalTable,
        target: PipeTarget,
        grp: &DalData,
        mbr_id: u32,
    ) -> DalResult<()>;

    /// Fetch the value of one cell of a counter extern.
    fn counter_get(&self, name: &str, index: u32) -> DalResult<CounterData>;

    fn counter_clear(&self, name: &str, index: u32) -> DalResult<()>;
}

/// For a counter, this contains the number of bytes, packets, or both that
/// were counted.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub struct CounterData {
    pub pkts: Option<u64>,
    pub bytes: Option<u64>,
}
