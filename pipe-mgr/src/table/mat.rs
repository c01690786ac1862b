// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Match-action tables.
//!
//! An entry's action either carries its parameters inline, or refers to a
//! member of the table's action-data table or a group of its selector table.
//! A referenced member or group holds a count of the entries pointing at it,
//! and every change to that count happens with both tables locked.

use aal::ActionArg;
use aal::DalAction;
use aal::DalData;
use aal::DalEntry;
use aal::MatchSpec;
use aal::PipeTarget;
use slog::{debug, trace};

use super::adt::AdtEntry;
use super::sel::SelGroup;
use super::Locked;
use super::Table;
use crate::codec;
use crate::key_index::MatchKey;
use crate::profile::Pipeline;
use crate::types::*;

/// The action to attach to a match-action entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionSpec {
    /// Run an action with the given parameters
    Direct {
        act_fn_hdl: ActFnHdl,
        args: Vec<ActionArg>,
    },
    /// Use an existing action-data member
    Member(MbrId),
    /// Create a new action-data member and use it
    NewMember {
        mbr_id: MbrId,
        act_fn_hdl: ActFnHdl,
        args: Vec<ActionArg>,
    },
    /// Use a selector group
    Group(GrpId),
}

// The action as stored with an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EntryAction {
    Direct { act_fn_hdl: ActFnHdl, data: Vec<u8> },
    Member(MbrId),
    Group(GrpId),
}

impl EntryAction {
    fn to_dal(&self) -> DalAction {
        match self {
            EntryAction::Direct { act_fn_hdl, data } => DalAction::Direct {
                act_fn_hdl: *act_fn_hdl,
                data: data.clone(),
            },
            EntryAction::Member(m) => DalAction::Member(*m),
            EntryAction::Group(g) => DalAction::Group(*g),
        }
    }
}

// An action that has been validated and encoded, but which hasn't yet taken
// a reference on anything.
enum Prepared {
    Direct { act_fn_hdl: ActFnHdl, data: Vec<u8> },
    Member(MbrId),
    NewMember {
        mbr_id: MbrId,
        act_fn_hdl: ActFnHdl,
        data: Vec<u8>,
    },
    Group(GrpId),
}

pub struct MatEntry {
    pub(crate) target: PipeTarget,
    pub(crate) spec: MatchSpec,
    pub(crate) key: MatchKey,
    pub(crate) action: EntryAction,
    pub(crate) dal: DalData,
}

/// A match-action entry as reported to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatEntryInfo {
    pub hdl: EntryHdl,
    pub target: PipeTarget,
    pub match_spec: MatchSpec,
    pub action: ActionSpec,
}

// The locks needed to operate on a match table: the table itself, and the
// action-data and selector tables it refers to.
struct MatLocks<'a> {
    mat: Locked<'a, MatEntry>,
    adt: Option<Locked<'a, AdtEntry>>,
    sel: Option<Locked<'a, SelGroup>>,
}

fn no_ref(mat: &Table<MatEntry>, what: &str) -> PipeMgrError {
    PipeMgrError::SchemaMismatch(format!("{} has no {what} table", mat.name()))
}

impl Pipeline {
    // Take the locks for a match table and the tables it refers to, in
    // ascending handle order.
    fn mat_locks<'a>(
        &'a self,
        mat: &'a Table<MatEntry>,
    ) -> PipeMgrResult<MatLocks<'a>> {
        let adt = mat.ctx.adt_ref.map(|h| self.adt(h)).transpose()?;
        let sel = mat.ctx.sel_ref.map(|h| self.sel(h)).transpose()?;

        let mut order = vec![mat.handle()];
        order.extend(adt.map(|t| t.handle()));
        order.extend(sel.map(|t| t.handle()));
        order.sort_unstable();

        let (mut ml, mut al, mut sl) = (None, None, None);
        for hdl in order {
            if hdl == mat.handle() {
                ml = Some(mat.lock());
            } else if let Some(t) = adt.filter(|t| t.handle() == hdl) {
                al = Some(t.lock());
            } else if let Some(t) = sel.filter(|t| t.handle() == hdl) {
                sl = Some(t.lock());
            }
        }
        let mat = ml.ok_or_else(|| {
            PipeMgrError::Invalid(format!("failed to lock {}", mat.name()))
        })?;
        Ok(MatLocks {
            mat,
            adt: al,
            sel: sl,
        })
    }

    // Validate and encode an action before any lock is taken.
    fn mat_prepare(
        &self,
        mat: &Table<MatEntry>,
        action: &ActionSpec,
        as_default: bool,
    ) -> PipeMgrResult<Prepared> {
        let ctx = &mat.ctx;
        Ok(match action {
            ActionSpec::Direct { act_fn_hdl, args } => {
                if ctx.adt_ref.is_some() {
                    return Err(PipeMgrError::SchemaMismatch(format!(
                        "{} takes its action data from a shared table",
                        ctx.name
                    )));
                }
                let act = ctx.action(*act_fn_hdl)?;
                let allowed = match as_default {
                    true => act.flags.allowed_as_default,
                    false => act.flags.allowed_as_hit,
                };
                if !allowed {
                    return Err(PipeMgrError::SchemaMismatch(format!(
                        "action {} may not be used {}",
                        act.name,
                        if as_default { "on a miss" } else { "on a hit" }
                    )));
                }
                Prepared::Direct {
                    act_fn_hdl: *act_fn_hdl,
                    data: codec::pack(&act.params, args)?,
                }
            }
            ActionSpec::Member(mbr_id) => {
                ctx.adt_ref.ok_or_else(|| no_ref(mat, "action data"))?;
                Prepared::Member(*mbr_id)
            }
            ActionSpec::NewMember {
                mbr_id,
                act_fn_hdl,
                args,
            } => {
                let adt_hdl =
                    ctx.adt_ref.ok_or_else(|| no_ref(mat, "action data"))?;
                let act = self.adt(adt_hdl)?.ctx.action(*act_fn_hdl)?;
                Prepared::NewMember {
                    mbr_id: *mbr_id,
                    act_fn_hdl: *act_fn_hdl,
                    data: codec::pack(&act.params, args)?,
                }
            }
            ActionSpec::Group(grp_id) => {
                ctx.sel_ref.ok_or_else(|| no_ref(mat, "selector"))?;
                Prepared::Group(*grp_id)
            }
        })
    }

    // Take a reference on whatever the action points at, creating a new
    // action-data member if asked to.  Returns the action to store and
    // whether a member was created.
    fn mat_take_ref(
        &self,
        locks: &mut MatLocks,
        target: PipeTarget,
        prepared: Prepared,
    ) -> PipeMgrResult<(EntryAction, bool)> {
        let driver = self.driver.as_ref();
        let mat = locks.mat.table;
        match prepared {
            Prepared::Direct { act_fn_hdl, data } => {
                Ok((EntryAction::Direct { act_fn_hdl, data }, false))
            }
            Prepared::Member(mbr_id) => {
                let adt = locks
                    .adt
                    .as_mut()
                    .ok_or_else(|| no_ref(mat, "action data"))?;
                adt.table.member_ref(&mut adt.state, mbr_id, target)?;
                Ok((EntryAction::Member(mbr_id), false))
            }
            Prepared::NewMember {
                mbr_id,
                act_fn_hdl,
                data,
            } => {
                let adt = locks
                    .adt
                    .as_mut()
                    .ok_or_else(|| no_ref(mat, "action data"))?;
                adt.table.member_create(
                    &mut adt.state,
                    driver,
                    target,
                    mbr_id,
                    act_fn_hdl,
                    data,
                )?;
                adt.table.member_ref(&mut adt.state, mbr_id, target)?;
                Ok((EntryAction::Member(mbr_id), true))
            }
            Prepared::Group(grp_id) => {
                let sel = locks
                    .sel
                    .as_mut()
                    .ok_or_else(|| no_ref(mat, "selector"))?;
                sel.table.group_ref(&mut sel.state, grp_id, target)?;
                Ok((EntryAction::Group(grp_id), false))
            }
        }
    }

    // Drop the reference an entry's action holds.  With `gc` set, an
    // action-data member left unreferenced is deleted.
    fn mat_drop_ref(
        &self,
        locks: &mut MatLocks,
        action: &EntryAction,
        gc: bool,
    ) -> PipeMgrResult<()> {
        let driver = self.driver.as_ref();
        let mat = locks.mat.table;
        match action {
            EntryAction::Direct { .. } => Ok(()),
            EntryAction::Member(mbr_id) => {
                let adt = locks
                    .adt
                    .as_mut()
                    .ok_or_else(|| no_ref(mat, "action data"))?;
                adt.table.member_unref(&mut adt.state, driver, *mbr_id, gc)
            }
            EntryAction::Group(grp_id) => {
                let sel = locks
                    .sel
                    .as_mut()
                    .ok_or_else(|| no_ref(mat, "selector"))?;
                sel.table.group_unref(&mut sel.state, *grp_id)
            }
        }
    }

    // Undo `mat_take_ref` on the way out of a failed operation
    fn mat_unwind_ref(
        &self,
        locks: &mut MatLocks,
        action: &EntryAction,
        created: bool,
        initial: PipeMgrError,
    ) -> PipeMgrError {
        match self.mat_drop_ref(locks, action, created) {
            Ok(()) => initial,
            Err(e) => PipeMgrError::unwind(initial, e),
        }
    }

    /// Add an entry to a match-action table, returning its handle.  Tables
    /// that don't store their entries return [`INVALID_HDL`].
    pub fn mat_ent_add(
        &self,
        tbl_hdl: TableHdl,
        target: PipeTarget,
        spec: &MatchSpec,
        action: &ActionSpec,
    ) -> PipeMgrResult<EntryHdl> {
        let mat = self.mat(tbl_hdl)?;
        self.mat_add(mat, target, spec, action, false)
    }

    /// Add an entry on behalf of a dataplane miss, using the table's default
    /// action.  This goes through the same checks as any other add.
    pub fn mat_add_on_miss(
        &self,
        tbl_hdl: TableHdl,
        target: PipeTarget,
        spec: &MatchSpec,
        args: &[ActionArg],
    ) -> PipeMgrResult<EntryHdl> {
        let mat = self.mat(tbl_hdl)?;
        let act_fn_hdl = match mat.ctx.default_action_handle {
            Some(h) if mat.ctx.flags.add_on_miss => h,
            _ => {
                return Err(PipeMgrError::Invalid(format!(
                    "{} does not add entries on a miss",
                    mat.name()
                )))
            }
        };
        let action = ActionSpec::Direct {
            act_fn_hdl,
            args: args.to_vec(),
        };
        self.mat_add(mat, target, spec, &action, true)
    }

    fn mat_add(
        &self,
        mat: &Table<MatEntry>,
        target: PipeTarget,
        spec: &MatchSpec,
        action: &ActionSpec,
        as_default: bool,
    ) -> PipeMgrResult<EntryHdl> {
        let replicas = mat.replicas(target)?;
        let key = MatchKey::build(&mat.ctx, spec)?;
        let prepared = self.mat_prepare(mat, action, as_default)?;

        if !mat.ctx.flags.store_entries {
            let Prepared::Direct { act_fn_hdl, data } = prepared else {
                return Err(mat.not_stored());
            };
            let mut l = mat.lock();
            let entry = DalEntry::Match {
                key: spec.clone(),
                action: DalAction::Direct { act_fn_hdl, data },
            };
            self.driver.entry_add(&mat.dal, target, &entry)?;
            l.state.usage.inserts += 1;
            trace!(mat.log, "added unstored entry"; "target" => %target);
            return Ok(INVALID_HDL);
        }

        let mut locks = self.mat_locks(mat)?;
        {
            let st = &mut *locks.mat.state;
            st.check_space(&mat.ctx)?;
            let store = st.stored(mat.name())?;
            if store.key_collides(replicas.clone(), &key) {
                let existing = store.key_lookup(replicas.clone(), &key);
                st.usage.collisions += 1;
                return Err(PipeMgrError::DuplicateEntry(format!(
                    "{} already holds entry {} for this key",
                    mat.name(),
                    existing.unwrap_or(INVALID_HDL)
                )));
            }
        }

        let (action, created) =
            self.mat_take_ref(&mut locks, target, prepared)?;
        let dal_entry = DalEntry::Match {
            key: spec.clone(),
            action: action.to_dal(),
        };

        let st = &mut *locks.mat.state;
        let result = st.stored(mat.name())?.insert_with(
            replicas,
            Some(&key),
            |_| {
                let dal = self.driver.entry_add(&mat.dal, target, &dal_entry)?;
                Ok(MatEntry {
                    target,
                    spec: spec.clone(),
                    key: key.clone(),
                    action: action.clone(),
                    dal,
                })
            },
        );
        match result {
            Ok(hdl) => {
                st.count_insert();
                debug!(mat.log, "added entry {hdl}"; "target" => %target);
                Ok(hdl)
            }
            Err(e) => {
                if matches!(e, PipeMgrError::Exhausted(_)) {
                    st.usage.exhaustion += 1;
                }
                Err(self.mat_unwind_ref(&mut locks, &action, created, e))
            }
        }
    }

    /// Delete an entry by handle.  If it held the last reference to an
    /// action-data member, the member is deleted as well.
    pub fn mat_ent_del(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
    ) -> PipeMgrResult<()> {
        let mat = self.mat(tbl_hdl)?;
        if !mat.ctx.flags.store_entries {
            return Err(mat.not_stored());
        }
        let mut locks = self.mat_locks(mat)?;
        self.mat_del_locked(&mut locks, hdl)
    }

    fn mat_del_locked(
        &self,
        locks: &mut MatLocks,
        hdl: EntryHdl,
    ) -> PipeMgrResult<()> {
        let mat = locks.mat.table;
        let st = &mut *locks.mat.state;
        let store = st.stored(mat.name())?;
        let (target, dal) = match store.get(hdl) {
            Ok(e) => (e.target, e.dal),
            Err(e) => {
                st.usage.delete_misses += 1;
                return Err(e);
            }
        };
        if let Err(e) = self.driver.entry_del(&mat.dal, target, &dal) {
            st.usage.delete_misses += 1;
            return Err(e.into());
        }

        let replicas = mat.replicas(target)?;
        let store = st.stored(mat.name())?;
        let key = store.get(hdl)?.key.clone();
        let entry = store.remove(hdl, replicas, Some(&key), None)?;
        st.count_delete();
        debug!(mat.log, "deleted entry {hdl}");
        self.mat_drop_ref(locks, &entry.action, true)
    }

    /// Delete the entry matching a spec.  For tables that don't store their
    /// entries the request goes straight to the driver.
    pub fn mat_ent_del_by_spec(
        &self,
        tbl_hdl: TableHdl,
        target: PipeTarget,
        spec: &MatchSpec,
    ) -> PipeMgrResult<()> {
        let mat = self.mat(tbl_hdl)?;
        let replicas = mat.replicas(target)?;
        let key = MatchKey::build(&mat.ctx, spec)?;

        if !mat.ctx.flags.store_entries {
            let mut l = mat.lock();
            self.driver.entry_del_by_key(&mat.dal, target, spec)?;
            l.state.usage.deletes += 1;
            return Ok(());
        }

        let mut locks = self.mat_locks(mat)?;
        let st = &mut *locks.mat.state;
        let Some(hdl) = st.stored(mat.name())?.key_lookup(replicas, &key)
        else {
            st.usage.delete_misses += 1;
            return Err(PipeMgrError::NotFound(format!(
                "no entry in {} matches the match spec",
                mat.name()
            )));
        };
        self.mat_del_locked(&mut locks, hdl)
    }

    /// Replace the action of an existing entry.  The new action's reference
    /// is taken before the old one is dropped, so a member shared by both
    /// never transiently loses its last reference.
    pub fn mat_ent_modify(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
        action: &ActionSpec,
    ) -> PipeMgrResult<()> {
        let mat = self.mat(tbl_hdl)?;
        if !mat.ctx.flags.store_entries {
            return Err(mat.not_stored());
        }
        let prepared = self.mat_prepare(mat, action, false)?;

        let mut locks = self.mat_locks(mat)?;
        let (target, spec, dal, old) = {
            let st = &mut *locks.mat.state;
            match st.stored(mat.name())?.get(hdl) {
                Ok(e) => (e.target, e.spec.clone(), e.dal, e.action.clone()),
                Err(e) => {
                    st.usage.update_misses += 1;
                    return Err(e);
                }
            }
        };

        let (new, created) = self.mat_take_ref(&mut locks, target, prepared)?;
        let dal_entry = DalEntry::Match {
            key: spec,
            action: new.to_dal(),
        };
        if let Err(e) =
            self.driver.entry_update(&mat.dal, target, &dal, &dal_entry)
        {
            locks.mat.state.usage.update_misses += 1;
            let e = e.into();
            return Err(self.mat_unwind_ref(&mut locks, &new, created, e));
        }

        let st = &mut *locks.mat.state;
        st.stored(mat.name())?.get_mut(hdl)?.action = new;
        st.usage.updates += 1;
        debug!(mat.log, "modified entry {hdl}");
        self.mat_drop_ref(&mut locks, &old, true)
    }

    /// Fetch an entry, with its action parameters decoded
    pub fn mat_ent_get(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
    ) -> PipeMgrResult<MatEntryInfo> {
        let mat = self.mat(tbl_hdl)?;
        let mut l = mat.lock();
        let e = l.state.stored(mat.name())?.get(hdl)?;
        let action = match &e.action {
            EntryAction::Direct { act_fn_hdl, data } => {
                let act = mat.ctx.action(*act_fn_hdl)?;
                ActionSpec::Direct {
                    act_fn_hdl: *act_fn_hdl,
                    args: codec::unpack(&act.params, data)?,
                }
            }
            EntryAction::Member(m) => ActionSpec::Member(*m),
            EntryAction::Group(g) => ActionSpec::Group(*g),
        };
        Ok(MatEntryInfo {
            hdl,
            target: e.target,
            match_spec: e.spec.clone(),
            action,
        })
    }

    /// Find the entry whose key equals the canonical form of `spec`
    pub fn mat_lookup_by_spec(
        &self,
        tbl_hdl: TableHdl,
        target: PipeTarget,
        spec: &MatchSpec,
    ) -> PipeMgrResult<Option<EntryHdl>> {
        let mat = self.mat(tbl_hdl)?;
        let replicas = mat.replicas(target)?;
        let key = MatchKey::build(&mat.ctx, spec)?;
        let mut l = mat.lock();
        Ok(l.state.stored(mat.name())?.key_lookup(replicas, &key))
    }

    pub(crate) fn mat_clear(&self, tbl_hdl: TableHdl) -> PipeMgrResult<()> {
        let mat = self.mat(tbl_hdl)?;
        let mut locks = self.mat_locks(mat)?;
        let st = &mut *locks.mat.state;
        let actions: Vec<EntryAction> = match st.store.as_ref() {
            Some(s) => s.entries.values().map(|e| e.action.clone()).collect(),
            None => Vec::new(),
        };
        mat.clear(st, self.driver.as_ref())?;

        // Members survive the entries that referred to them
        for action in &actions {
            self.mat_drop_ref(&mut locks, action, false)?;
        }
        Ok(())
    }
}
