// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Selector tables: groups of action-data members, one of which is chosen
//! per packet by the dataplane's hash.  Every member slot in a group holds a
//! reference on its action-data member.

use aal::DalData;
use aal::PipeTarget;
use slog::debug;

use super::adt::AdtEntry;
use super::covers;
use super::lock_two;
use super::Locked;
use super::Table;
use super::TableState;
use crate::profile::Pipeline;
use crate::types::*;

pub struct SelGroup {
    pub(crate) grp_id: GrpId,
    pub(crate) target: PipeTarget,
    pub(crate) max_size: u32,
    /// Members in the order they were added
    pub(crate) members: Vec<MbrId>,
    /// Number of match entries using this group
    pub(crate) refs: u32,
    pub(crate) dal: DalData,
}

/// A selector group as reported to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelGroupInfo {
    pub hdl: EntryHdl,
    pub grp_id: GrpId,
    pub target: PipeTarget,
    pub max_size: u32,
    pub members: Vec<MbrId>,
    pub ref_count: u32,
}

fn no_group(table: &str, grp_id: GrpId) -> PipeMgrError {
    PipeMgrError::NotFound(format!("group {grp_id} in {table}"))
}

impl Table<SelGroup> {
    fn group_mut<'s>(
        &self,
        st: &'s mut TableState<SelGroup>,
        grp_id: GrpId,
    ) -> PipeMgrResult<&'s mut SelGroup> {
        let store = st.stored(self.name())?;
        let hdl = store
            .hdl_by_id(grp_id)
            .ok_or_else(|| no_group(self.name(), grp_id))?;
        store.get_mut(hdl)
    }

    /// Take a reference on a group for a match entry installed on `target`
    pub(crate) fn group_ref(
        &self,
        st: &mut TableState<SelGroup>,
        grp_id: GrpId,
        target: PipeTarget,
    ) -> PipeMgrResult<()> {
        let g = self.group_mut(st, grp_id)?;
        if !covers(g.target, target) {
            return Err(PipeMgrError::Invalid(format!(
                "group {grp_id} is installed on pipe {}, not {target}",
                g.target
            )));
        }
        g.refs += 1;
        Ok(())
    }

    pub(crate) fn group_unref(
        &self,
        st: &mut TableState<SelGroup>,
        grp_id: GrpId,
    ) -> PipeMgrResult<()> {
        let g = self.group_mut(st, grp_id)?;
        if g.refs == 0 {
            return Err(PipeMgrError::Invalid(format!(
                "group {grp_id} has no references to drop"
            )));
        }
        g.refs -= 1;
        Ok(())
    }
}

impl Pipeline {
    // Lock a selector table along with the action-data table it draws its
    // members from.
    fn sel_locks(
        &self,
        tbl_hdl: TableHdl,
    ) -> PipeMgrResult<(Locked<'_, SelGroup>, Locked<'_, AdtEntry>)> {
        let sel = self.sel(tbl_hdl)?;
        let adt_hdl = sel.ctx.adt_ref.ok_or_else(|| {
            PipeMgrError::Schema(format!("{} has no members", sel.name()))
        })?;
        let adt = self.adt(adt_hdl)?;
        Ok(lock_two(sel, adt))
    }

    /// Create an empty group that may hold up to `max_size` members
    pub fn sel_grp_add(
        &self,
        tbl_hdl: TableHdl,
        target: PipeTarget,
        grp_id: GrpId,
        max_size: u32,
    ) -> PipeMgrResult<EntryHdl> {
        let sel = self.sel(tbl_hdl)?;
        sel.replicas(target)?;
        if max_size == 0 || max_size > sel.ctx.max_group_size {
            return Err(PipeMgrError::Invalid(format!(
                "group size {max_size} outside 1..={} for {}",
                sel.ctx.max_group_size,
                sel.name()
            )));
        }

        let mut l = sel.lock();
        let st = &mut *l.state;
        st.check_space(&sel.ctx)?;
        let store = st.stored(sel.name())?;
        if store.hdl_by_id(grp_id).is_some() {
            st.usage.collisions += 1;
            return Err(PipeMgrError::Exists(format!(
                "group {grp_id} in {}",
                sel.name()
            )));
        }
        let hdl = store.insert_with(0..0, None, |_| {
            let dal =
                self.driver.group_add(&sel.dal, target, grp_id, max_size)?;
            Ok(SelGroup {
                grp_id,
                target,
                max_size,
                members: Vec::new(),
                refs: 0,
                dal,
            })
        })?;
        store.by_id.insert(grp_id, hdl);
        st.count_insert();
        debug!(sel.log, "added group {grp_id}";
            "hdl" => hdl, "max_size" => max_size);
        Ok(hdl)
    }

    /// Delete a group, dropping the references its members held.  Fails with
    /// `InUse` while any match entry refers to the group.
    pub fn sel_grp_del(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
    ) -> PipeMgrResult<()> {
        let (mut sl, mut al) = self.sel_locks(tbl_hdl)?;
        let sel = sl.table;
        let st = &mut *sl.state;
        let store = st.stored(sel.name())?;
        let (target, dal, refs, grp_id) = match store.get(hdl) {
            Ok(g) => (g.target, g.dal, g.refs, g.grp_id),
            Err(e) => {
                st.usage.delete_misses += 1;
                return Err(e);
            }
        };
        if refs > 0 {
            return Err(PipeMgrError::InUse(format!(
                "group {hdl} of {} has {refs} references",
                sel.name()
            )));
        }
        self.driver.group_del(&sel.dal, target, &dal)?;
        let g = store.remove(hdl, 0..0, None, Some(grp_id))?;
        st.count_delete();
        debug!(sel.log, "deleted group {}", g.grp_id; "hdl" => hdl);

        for mbr_id in g.members {
            al.table.member_unref(
                &mut al.state,
                self.driver.as_ref(),
                mbr_id,
                true,
            )?;
        }
        Ok(())
    }

    /// Add a member to a group.  Fails with `GroupFull` if the group already
    /// holds its maximum number of members.
    pub fn sel_grp_mbr_add(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
        mbr_id: MbrId,
    ) -> PipeMgrResult<()> {
        let (mut sl, mut al) = self.sel_locks(tbl_hdl)?;
        let sel = sl.table;
        let g = sl.state.stored(sel.name())?.get_mut(hdl)?;
        if g.members.len() as u32 >= g.max_size {
            return Err(PipeMgrError::GroupFull {
                table: sel.name().to_string(),
                grp_id: g.grp_id,
            });
        }
        if !sel.ctx.allow_duplicate_members && g.members.contains(&mbr_id) {
            return Err(PipeMgrError::DuplicateEntry(format!(
                "member {mbr_id} is already in group {}",
                g.grp_id
            )));
        }

        let driver = self.driver.as_ref();
        al.table.member_ref(&mut al.state, mbr_id, g.target)?;
        if let Err(e) =
            driver.group_member_add(&sel.dal, g.target, &g.dal, mbr_id)
        {
            let unref =
                al.table.member_unref(&mut al.state, driver, mbr_id, false);
            return Err(match unref {
                Ok(()) => e.into(),
                Err(u) => PipeMgrError::unwind(e.into(), u),
            });
        }
        g.members.push(mbr_id);
        debug!(sel.log, "added member {mbr_id} to group {}", g.grp_id);
        Ok(())
    }

    /// Remove one instance of a member from a group
    pub fn sel_grp_mbr_del(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
        mbr_id: MbrId,
    ) -> PipeMgrResult<()> {
        let (mut sl, mut al) = self.sel_locks(tbl_hdl)?;
        let sel = sl.table;
        let g = sl.state.stored(sel.name())?.get_mut(hdl)?;
        let idx = g.members.iter().position(|m| *m == mbr_id).ok_or_else(
            || {
                PipeMgrError::NotFound(format!(
                    "member {mbr_id} in group {}",
                    g.grp_id
                ))
            },
        )?;
        self.driver
            .group_member_del(&sel.dal, g.target, &g.dal, mbr_id)?;
        g.members.remove(idx);
        debug!(sel.log, "removed member {mbr_id} from group {}", g.grp_id);
        al.table
            .member_unref(&mut al.state, self.driver.as_ref(), mbr_id, true)
    }

    pub fn sel_grp_get(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
    ) -> PipeMgrResult<SelGroupInfo> {
        let sel = self.sel(tbl_hdl)?;
        let mut l = sel.lock();
        let g = l.state.stored(sel.name())?.get(hdl)?;
        Ok(SelGroupInfo {
            hdl,
            grp_id: g.grp_id,
            target: g.target,
            max_size: g.max_size,
            members: g.members.clone(),
            ref_count: g.refs,
        })
    }

    /// Find a group's handle from its group id
    pub fn sel_hdl_by_grp_id(
        &self,
        tbl_hdl: TableHdl,
        grp_id: GrpId,
    ) -> PipeMgrResult<EntryHdl> {
        let sel = self.sel(tbl_hdl)?;
        let mut l = sel.lock();
        l.state
            .stored(sel.name())?
            .hdl_by_id(grp_id)
            .ok_or_else(|| no_group(sel.name(), grp_id))
    }

    pub(crate) fn sel_clear(&self, tbl_hdl: TableHdl) -> PipeMgrResult<()> {
        let (mut sl, mut al) = self.sel_locks(tbl_hdl)?;
        let sel = sl.table;
        let st = &mut *sl.state;
        let mut members = Vec::new();
        if let Some(store) = st.store.as_ref() {
            if let Some(g) = store.entries.values().find(|g| g.refs > 0) {
                return Err(PipeMgrError::InUse(format!(
                    "group {} of {} is referenced",
                    g.grp_id,
                    sel.name()
                )));
            }
            for g in store.entries.values() {
                members.extend(g.members.iter().copied());
            }
        }
        sel.clear(st, self.driver.as_ref())?;

        for mbr_id in members {
            al.table.member_unref(
                &mut al.state,
                self.driver.as_ref(),
                mbr_id,
                false,
            )?;
        }
        Ok(())
    }
}
