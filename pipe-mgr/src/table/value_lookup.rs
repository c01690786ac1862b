// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Value-lookup tables map a match key straight to a blob of data fields,
//! with no action in between.

use aal::ActionArg;
use aal::DalData;
use aal::DalEntry;
use aal::MatchSpec;
use aal::PipeTarget;
use slog::debug;

use super::Table;
use super::TableState;
use crate::codec;
use crate::key_index::MatchKey;
use crate::profile::Pipeline;
use crate::types::*;

pub struct VlEntry {
    pub(crate) target: PipeTarget,
    pub(crate) spec: MatchSpec,
    pub(crate) key: MatchKey,
    pub(crate) data: Vec<u8>,
    pub(crate) dal: DalData,
}

/// A value-lookup entry as reported to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlEntryInfo {
    pub hdl: EntryHdl,
    pub target: PipeTarget,
    pub match_spec: MatchSpec,
    pub data: Vec<ActionArg>,
}

impl Pipeline {
    /// Add an entry to a value-lookup table, returning its handle.  Tables
    /// that don't store their entries return [`INVALID_HDL`].
    pub fn vl_ent_add(
        &self,
        tbl_hdl: TableHdl,
        target: PipeTarget,
        spec: &MatchSpec,
        data: &[ActionArg],
    ) -> PipeMgrResult<EntryHdl> {
        let vl = self.vl(tbl_hdl)?;
        let replicas = vl.replicas(target)?;
        let key = MatchKey::build(&vl.ctx, spec)?;
        let data = codec::pack(&vl.ctx.data_fields, data)?;
        let dal_entry = DalEntry::Value {
            key: spec.clone(),
            data: data.clone(),
        };

        let mut l = vl.lock();
        let st = &mut *l.state;
        if !vl.ctx.flags.store_entries {
            self.driver.entry_add(&vl.dal, target, &dal_entry)?;
            st.usage.inserts += 1;
            return Ok(INVALID_HDL);
        }

        st.check_space(&vl.ctx)?;
        let store = st.stored(vl.name())?;
        if store.key_collides(replicas.clone(), &key) {
            let existing = store.key_lookup(replicas.clone(), &key);
            st.usage.collisions += 1;
            return Err(PipeMgrError::DuplicateEntry(format!(
                "{} already holds entry {} for this key",
                vl.name(),
                existing.unwrap_or(INVALID_HDL)
            )));
        }
        let hdl = store.insert_with(replicas, Some(&key), |_| {
            let dal = self.driver.entry_add(&vl.dal, target, &dal_entry)?;
            Ok(VlEntry {
                target,
                spec: spec.clone(),
                key: key.clone(),
                data,
                dal,
            })
        })?;
        st.count_insert();
        debug!(vl.log, "added entry {hdl}"; "target" => %target);
        Ok(hdl)
    }

    /// Replace the data of an existing entry
    pub fn vl_ent_modify(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
        data: &[ActionArg],
    ) -> PipeMgrResult<()> {
        let vl = self.vl(tbl_hdl)?;
        let data = codec::pack(&vl.ctx.data_fields, data)?;
        let mut l = vl.lock();
        let st = &mut *l.state;
        let e = match st.stored(vl.name())?.get_mut(hdl) {
            Ok(e) => e,
            Err(e) => {
                st.usage.update_misses += 1;
                return Err(e);
            }
        };
        let dal_entry = DalEntry::Value {
            key: e.spec.clone(),
            data: data.clone(),
        };
        self.driver
            .entry_update(&vl.dal, e.target, &e.dal, &dal_entry)?;
        e.data = data;
        st.usage.updates += 1;
        Ok(())
    }

    pub fn vl_ent_del(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
    ) -> PipeMgrResult<()> {
        let vl = self.vl(tbl_hdl)?;
        let mut l = vl.lock();
        self.vl_del_locked(vl, &mut l.state, hdl)
    }

    fn vl_del_locked(
        &self,
        vl: &Table<VlEntry>,
        st: &mut TableState<VlEntry>,
        hdl: EntryHdl,
    ) -> PipeMgrResult<()> {
        let store = st.stored(vl.name())?;
        let (target, dal, key) = match store.get(hdl) {
            Ok(e) => (e.target, e.dal, e.key.clone()),
            Err(e) => {
                st.usage.delete_misses += 1;
                return Err(e);
            }
        };
        if let Err(e) = self.driver.entry_del(&vl.dal, target, &dal) {
            st.usage.delete_misses += 1;
            return Err(e.into());
        }
        let replicas = vl.replicas(target)?;
        st.stored(vl.name())?.remove(hdl, replicas, Some(&key), None)?;
        st.count_delete();
        debug!(vl.log, "deleted entry {hdl}");
        Ok(())
    }

    /// Delete the entry matching a spec.  For tables that don't store their
    /// entries the request goes straight to the driver.
    pub fn vl_ent_del_by_spec(
        &self,
        tbl_hdl: TableHdl,
        target: PipeTarget,
        spec: &MatchSpec,
    ) -> PipeMgrResult<()> {
        let vl = self.vl(tbl_hdl)?;
        let replicas = vl.replicas(target)?;
        let key = MatchKey::build(&vl.ctx, spec)?;

        let mut l = vl.lock();
        let st = &mut *l.state;
        if !vl.ctx.flags.store_entries {
            self.driver.entry_del_by_key(&vl.dal, target, spec)?;
            st.usage.deletes += 1;
            return Ok(());
        }
        let Some(hdl) = st.stored(vl.name())?.key_lookup(replicas, &key)
        else {
            st.usage.delete_misses += 1;
            return Err(PipeMgrError::NotFound(format!(
                "no entry in {} matches the match spec",
                vl.name()
            )));
        };
        self.vl_del_locked(vl, st, hdl)
    }

    pub fn vl_ent_get(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
    ) -> PipeMgrResult<VlEntryInfo> {
        let vl = self.vl(tbl_hdl)?;
        let mut l = vl.lock();
        let e = l.state.stored(vl.name())?.get(hdl)?;
        Ok(VlEntryInfo {
            hdl,
            target: e.target,
            match_spec: e.spec.clone(),
            data: codec::unpack(&vl.ctx.data_fields, &e.data)?,
        })
    }

    /// Find the entry whose key equals the canonical form of `spec`
    pub fn vl_lookup_by_spec(
        &self,
        tbl_hdl: TableHdl,
        target: PipeTarget,
        spec: &MatchSpec,
    ) -> PipeMgrResult<Option<EntryHdl>> {
        let vl = self.vl(tbl_hdl)?;
        let replicas = vl.replicas(target)?;
        let key = MatchKey::build(&vl.ctx, spec)?;
        let mut l = vl.lock();
        Ok(l.state.stored(vl.name())?.key_lookup(replicas, &key))
    }

    pub(crate) fn vl_clear(&self, tbl_hdl: TableHdl) -> PipeMgrResult<()> {
        let vl = self.vl(tbl_hdl)?;
        let mut l = vl.lock();
        vl.clear(&mut l.state, self.driver.as_ref())
    }
}
