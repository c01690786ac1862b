// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! The pipeline manager tracks the table state of the programs loaded onto a
//! set of packet-processing devices.
//!
//! Each [`Device`] carries one or more [`Profile`]s, each a compiled program
//! exposing match-action, action-data, selector, and value-lookup tables.
//! Clients reach a profile's tables through [`PipeMgr::read`] and
//! [`PipeMgr::write`], which bracket every call with the client's session and
//! take the locks in a fixed order:
//!
//!   session -> device registry -> profile -> table(s)
//!
//! The registry lock is only held long enough to find the profile.  Entry
//! operations run under the profile's read lock and serialize on the
//! individual table locks; a call that needs two or more tables locks them in
//! ascending handle order.  Structural operations, such as clearing a table,
//! run under the profile's write lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use slog::{info, o};

pub mod codec;
pub mod config;
pub mod context;
pub mod device;
pub mod externs;
pub mod fields;
pub mod idalloc;
pub mod key_index;
pub mod profile;
pub mod session;
pub mod table;
pub mod types;

pub use device::Device;
pub use device::DeviceFamily;
pub use profile::Pipeline;
pub use profile::Profile;
pub use session::SessionInfo;
pub use table::mat::ActionSpec;
pub use table::TableUsage;
pub use types::*;

/// The registry of every device under management, and the sessions through
/// which clients reach them.
pub struct PipeMgr {
    log: slog::Logger,
    devices: RwLock<BTreeMap<DevId, Arc<Device>>>,
    sessions: session::SessionPool,
}

impl PipeMgr {
    pub fn new(log: &slog::Logger, max_sessions: usize) -> Self {
        let log = log.new(o!("unit" => "pipe_mgr"));
        PipeMgr {
            sessions: session::SessionPool::new(&log, max_sessions),
            devices: RwLock::new(BTreeMap::new()),
            log,
        }
    }

    /// Build the registry and every device described by a configuration
    pub fn from_config(
        log: &slog::Logger,
        config: &config::Config,
    ) -> PipeMgrResult<Self> {
        let mgr = PipeMgr::new(log, config.max_sessions);
        for d in &config.devices {
            mgr.dev_add(Device::from_config(&mgr.log, d)?)?;
        }
        Ok(mgr)
    }

    pub fn dev_add(&self, dev: Device) -> PipeMgrResult<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(&dev.dev_id) {
            return Err(PipeMgrError::Exists(format!("device {}", dev.dev_id)));
        }
        info!(self.log, "added device {}", dev.dev_id;
            "family" => %dev.family,
            "profiles" => dev.profiles().len());
        devices.insert(dev.dev_id, Arc::new(dev));
        Ok(())
    }

    /// Remove a device from the registry and clear every one of its tables
    pub fn dev_remove(&self, dev_id: DevId) -> PipeMgrResult<()> {
        let dev = self
            .devices
            .write()
            .remove(&dev_id)
            .ok_or(PipeMgrError::NoSuchDevice(dev_id))?;
        info!(self.log, "removing device {dev_id}");
        dev.teardown()
    }

    pub fn dev_get(&self, dev_id: DevId) -> PipeMgrResult<Arc<Device>> {
        self.devices
            .read()
            .get(&dev_id)
            .cloned()
            .ok_or(PipeMgrError::NoSuchDevice(dev_id))
    }

    pub fn dev_ids(&self) -> Vec<DevId> {
        self.devices.read().keys().copied().collect()
    }

    pub fn profile(
        &self,
        dev_id: DevId,
        profile_id: u32,
    ) -> PipeMgrResult<Arc<Profile>> {
        self.dev_get(dev_id)?.profile(profile_id).cloned()
    }

    /// Run `f` against a profile's pipeline inside the session's bracket,
    /// with the profile read-locked.
    pub fn read<T>(
        &self,
        sess_hdl: SessHdl,
        dev_id: DevId,
        profile_id: u32,
        f: impl FnOnce(&Pipeline) -> PipeMgrResult<T>,
    ) -> PipeMgrResult<T> {
        let _sess = self.sessions.enter(sess_hdl)?;
        let profile = self.profile(dev_id, profile_id)?;
        profile.read(f)
    }

    /// Run `f` against a profile's pipeline inside the session's bracket,
    /// with the profile write-locked.
    pub fn write<T>(
        &self,
        sess_hdl: SessHdl,
        dev_id: DevId,
        profile_id: u32,
        f: impl FnOnce(&mut Pipeline) -> PipeMgrResult<T>,
    ) -> PipeMgrResult<T> {
        let _sess = self.sessions.enter(sess_hdl)?;
        let profile = self.profile(dev_id, profile_id)?;
        profile.write(f)
    }

    pub fn sessions(&self) -> &session::SessionPool {
        &self.sessions
    }

    /// Sessions currently inside their bracket
    pub fn sessions_in_use(&self) -> Vec<SessionInfo> {
        self.sessions.in_use()
    }

    /// Release a session leaked by a client that went away mid-call
    pub fn force_epilogue(&self, sess_hdl: SessHdl) -> PipeMgrResult<()> {
        self.sessions.force_epilogue(sess_hdl)
    }
}
