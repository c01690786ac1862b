// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Action-data tables: shared action parameter sets, each identified by a
//! caller-chosen member id and counted by the match entries and selector
//! groups referring to it.

use aal::ActionArg;
use aal::DalData;
use aal::DalEntry;
use aal::DalOps;
use aal::PipeTarget;
use slog::{debug, error};

use super::covers;
use super::Table;
use super::TableState;
use crate::codec;
use crate::profile::Pipeline;
use crate::types::*;

pub struct AdtEntry {
    pub(crate) mbr_id: MbrId,
    pub(crate) target: PipeTarget,
    pub(crate) act_fn_hdl: ActFnHdl,
    pub(crate) data: Vec<u8>,
    /// Number of match entries and selector group slots using this member
    pub(crate) refs: u32,
    pub(crate) dal: DalData,
}

/// An action-data member as reported to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdtEntryInfo {
    pub hdl: EntryHdl,
    pub mbr_id: MbrId,
    pub target: PipeTarget,
    pub act_fn_hdl: ActFnHdl,
    pub args: Vec<ActionArg>,
    pub ref_count: u32,
}

fn no_member(table: &str, mbr_id: MbrId) -> PipeMgrError {
    PipeMgrError::NotFound(format!("member {mbr_id} in {table}"))
}

impl Table<AdtEntry> {
    pub(crate) fn member_create(
        &self,
        st: &mut TableState<AdtEntry>,
        driver: &dyn DalOps,
        target: PipeTarget,
        mbr_id: MbrId,
        act_fn_hdl: ActFnHdl,
        data: Vec<u8>,
    ) -> PipeMgrResult<EntryHdl> {
        st.check_space(&self.ctx)?;
        let store = st.stored(self.name())?;
        if store.hdl_by_id(mbr_id).is_some() {
            st.usage.collisions += 1;
            return Err(PipeMgrError::Exists(format!(
                "member {mbr_id} in {}",
                self.name()
            )));
        }

        let dal_entry = DalEntry::ActionData {
            mbr_id,
            act_fn_hdl,
            data: data.clone(),
        };
        let hdl = store.insert_with(0..0, None, |_| {
            let dal = driver.entry_add(&self.dal, target, &dal_entry)?;
            Ok(AdtEntry {
                mbr_id,
                target,
                act_fn_hdl,
                data,
                refs: 0,
                dal,
            })
        })?;
        store.by_id.insert(mbr_id, hdl);
        st.count_insert();
        debug!(self.log, "added member {mbr_id}";
            "hdl" => hdl, "target" => %target);
        Ok(hdl)
    }

    fn member_remove(
        &self,
        st: &mut TableState<AdtEntry>,
        driver: &dyn DalOps,
        hdl: EntryHdl,
    ) -> PipeMgrResult<()> {
        let store = st.stored(self.name())?;
        let e = store.get(hdl)?;
        driver.entry_del(&self.dal, e.target, &e.dal)?;
        let mbr_id = e.mbr_id;
        let e = store.remove(hdl, 0..0, None, Some(mbr_id))?;
        st.count_delete();
        debug!(self.log, "deleted member {}", e.mbr_id; "hdl" => hdl);
        Ok(())
    }

    /// Take a reference on a member, on behalf of an object installed for
    /// `target`.
    pub(crate) fn member_ref(
        &self,
        st: &mut TableState<AdtEntry>,
        mbr_id: MbrId,
        target: PipeTarget,
    ) -> PipeMgrResult<()> {
        let store = st.stored(self.name())?;
        let hdl = store
            .hdl_by_id(mbr_id)
            .ok_or_else(|| no_member(self.name(), mbr_id))?;
        let e = store.get_mut(hdl)?;
        if !covers(e.target, target) {
            return Err(PipeMgrError::Invalid(format!(
                "member {mbr_id} is installed on pipe {}, not {target}",
                e.target
            )));
        }
        e.refs += 1;
        Ok(())
    }

    /// Drop a reference on a member.  When `gc` is set and this was the last
    /// reference, the member is deleted.  A member that can't be deleted is
    /// kept, unreferenced.
    pub(crate) fn member_unref(
        &self,
        st: &mut TableState<AdtEntry>,
        driver: &dyn DalOps,
        mbr_id: MbrId,
        gc: bool,
    ) -> PipeMgrResult<()> {
        let store = st.stored(self.name())?;
        let hdl = store
            .hdl_by_id(mbr_id)
            .ok_or_else(|| no_member(self.name(), mbr_id))?;
        let e = store.get_mut(hdl)?;
        if e.refs == 0 {
            return Err(PipeMgrError::Invalid(format!(
                "member {mbr_id} has no references to drop"
            )));
        }
        e.refs -= 1;
        if e.refs == 0 && gc {
            if let Err(e) = self.member_remove(st, driver, hdl) {
                error!(self.log, "failed to reclaim member {mbr_id}: {e}");
            }
        }
        Ok(())
    }
}

impl Pipeline {
    /// Add a member to an action-data table
    pub fn adt_ent_add(
        &self,
        tbl_hdl: TableHdl,
        target: PipeTarget,
        mbr_id: MbrId,
        act_fn_hdl: ActFnHdl,
        args: &[ActionArg],
    ) -> PipeMgrResult<EntryHdl> {
        let adt = self.adt(tbl_hdl)?;
        adt.replicas(target)?;
        let act = adt.ctx.action(act_fn_hdl)?;
        let data = codec::pack(&act.params, args)?;

        let mut l = adt.lock();
        adt.member_create(
            &mut l.state,
            self.driver.as_ref(),
            target,
            mbr_id,
            act_fn_hdl,
            data,
        )
    }

    /// Delete a member.  Fails with `InUse` while anything refers to it.
    pub fn adt_ent_del(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
    ) -> PipeMgrResult<()> {
        let adt = self.adt(tbl_hdl)?;
        let mut l = adt.lock();
        let st = &mut *l.state;
        let refs = match st.stored(adt.name())?.get(hdl) {
            Ok(e) => e.refs,
            Err(e) => {
                st.usage.delete_misses += 1;
                return Err(e);
            }
        };
        if refs > 0 {
            return Err(PipeMgrError::InUse(format!(
                "member {hdl} of {} has {refs} references",
                adt.name()
            )));
        }
        adt.member_remove(st, self.driver.as_ref(), hdl)
    }

    /// Replace a member's action data.  A member that is in use may change
    /// its parameters, but not its action.
    pub fn adt_ent_modify(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
        act_fn_hdl: ActFnHdl,
        args: &[ActionArg],
    ) -> PipeMgrResult<()> {
        let adt = self.adt(tbl_hdl)?;
        let act = adt.ctx.action(act_fn_hdl)?;
        let data = codec::pack(&act.params, args)?;

        let mut l = adt.lock();
        let st = &mut *l.state;
        let e = match st.stored(adt.name())?.get_mut(hdl) {
            Ok(e) => e,
            Err(e) => {
                st.usage.update_misses += 1;
                return Err(e);
            }
        };
        if e.refs > 0 && e.act_fn_hdl != act_fn_hdl {
            return Err(PipeMgrError::InUse(format!(
                "member {} is referenced and cannot change its action",
                e.mbr_id
            )));
        }
        let dal_entry = DalEntry::ActionData {
            mbr_id: e.mbr_id,
            act_fn_hdl,
            data: data.clone(),
        };
        self.driver
            .entry_update(&adt.dal, e.target, &e.dal, &dal_entry)?;
        e.act_fn_hdl = act_fn_hdl;
        e.data = data;
        st.usage.updates += 1;
        Ok(())
    }

    pub fn adt_ent_get(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
    ) -> PipeMgrResult<AdtEntryInfo> {
        let adt = self.adt(tbl_hdl)?;
        let mut l = adt.lock();
        let e = l.state.stored(adt.name())?.get(hdl)?;
        let act = adt.ctx.action(e.act_fn_hdl)?;
        Ok(AdtEntryInfo {
            hdl,
            mbr_id: e.mbr_id,
            target: e.target,
            act_fn_hdl: e.act_fn_hdl,
            args: codec::unpack(&act.params, &e.data)?,
            ref_count: e.refs,
        })
    }

    /// Find a member's handle from its member id
    pub fn adt_hdl_by_mbr_id(
        &self,
        tbl_hdl: TableHdl,
        mbr_id: MbrId,
    ) -> PipeMgrResult<EntryHdl> {
        let adt = self.adt(tbl_hdl)?;
        let mut l = adt.lock();
        l.state
            .stored(adt.name())?
            .hdl_by_id(mbr_id)
            .ok_or_else(|| no_member(adt.name(), mbr_id))
    }

    pub(crate) fn adt_clear(&self, tbl_hdl: TableHdl) -> PipeMgrResult<()> {
        let adt = self.adt(tbl_hdl)?;
        let mut l = adt.lock();
        let st = &mut *l.state;
        if let Some(store) = st.store.as_ref() {
            if let Some(e) = store.entries.values().find(|e| e.refs > 0) {
                return Err(PipeMgrError::InUse(format!(
                    "member {} of {} is referenced",
                    e.mbr_id,
                    adt.name()
                )));
            }
        }
        adt.clear(st, self.driver.as_ref())
    }
}
