// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! General types used throughout the pipeline manager.

use std::convert;

use aal::DalError;
use common::ports::PortError;

pub type DevId = u32;
pub type TableHdl = u32;
pub type EntryHdl = u32;
pub type ActFnHdl = u32;
pub type MbrId = u32;
pub type GrpId = u32;
pub type SessHdl = u32;

/// Reserved handle value.  The allocator never issues it, and it is returned
/// in place of a handle by tables that do not store their entries.
pub const INVALID_HDL: EntryHdl = 0xffff_ffff;

pub type PipeMgrResult<T> = Result<T, PipeMgrError>;

#[derive(Debug, thiserror::Error)]
pub enum PipeMgrError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),
    #[error("Identifier space exhausted: {0}")]
    Exhausted(String),
    #[error("Selector group {grp_id} in {table} is full")]
    GroupFull { table: String, grp_id: GrpId },
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("Value for {field} needs {bits} bits, field is {width} bits wide")]
    InvalidWidth {
        field: String,
        bits: usize,
        width: usize,
    },
    #[error("Session {0} is busy")]
    SessionBusy(SessHdl),
    #[error("Invalid session: {0}")]
    InvalidSession(SessHdl),
    #[error("Unknown field id: {0}")]
    UnknownField(u32),
    #[error("Table {0} is full")]
    TableFull(String),
    #[error("Resource is in use: {0}")]
    InUse(String),
    #[error("Table {0} does not store its entries")]
    NotStored(String),
    #[error("Resource already exists: {0}")]
    Exists(String),
    #[error("No such device: {0}")]
    NoSuchDevice(DevId),
    #[error("No such profile: {0}")]
    NoSuchProfile(String),
    #[error("No such table: {0}")]
    NoSuchTable(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Invalid pipeline context: {0}")]
    Schema(String),
    #[error("Driver error: {0}")]
    Driver(DalError),
    #[error("Port error: {0}")]
    Port(#[from] PortError),
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Unwind: initial: {initial}, unwind: {unwind}")]
    Unwind {
        initial: Box<PipeMgrError>,
        unwind: Box<PipeMgrError>,
    },
}

impl PipeMgrError {
    /// Combine the error that triggered a rollback with the error that
    /// caused the rollback itself to fail.
    pub fn unwind(initial: PipeMgrError, unwind: PipeMgrError) -> Self {
        PipeMgrError::Unwind {
            initial: Box::new(initial),
            unwind: Box::new(unwind),
        }
    }
}

impl convert::From<std::io::Error> for PipeMgrError {
    fn from(err: std::io::Error) -> Self {
        PipeMgrError::Io(err)
    }
}

impl convert::From<DalError> for PipeMgrError {
    fn from(err: DalError) -> Self {
        PipeMgrError::Driver(err)
    }
}

impl convert::From<serde_json::Error> for PipeMgrError {
    fn from(err: serde_json::Error) -> Self {
        PipeMgrError::Schema(err.to_string())
    }
}

impl convert::From<toml::de::Error> for PipeMgrError {
    fn from(err: toml::de::Error) -> Self {
        PipeMgrError::Config(err.to_string())
    }
}
