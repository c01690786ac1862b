// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Runtime state for the tables of a pipeline.
//!
//! Each table pairs its immutable [`TableContext`] with a single mutex guarding
//! everything that changes: the usage counters and, when the table stores its
//! entries, the handle allocator, the entries themselves, and one match-key
//! index per pipeline replica.  A table's mutex is only ever taken by a caller
//! already holding the owning profile's lock, and when two or more table
//! locks are needed at once they are taken in ascending table-handle order.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ops::Bound;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use serde::Serialize;
use slog::o;

use aal::DalOps;
use aal::DalTable;
use aal::PipeTarget;

use crate::context::TableContext;
use crate::idalloc::IdAllocator;
use crate::key_index::KeyIndex;
use crate::key_index::MatchKey;
use crate::profile::Pipeline;
use crate::types::*;

pub mod adt;
pub mod mat;
pub mod sel;
pub mod value_lookup;

/// Basic statistics about table usage
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TableUsage {
    /// Maximum number of entries in the table
    pub size: u32,
    /// Current number of entries in the table
    pub occupancy: u32,
    /// Total number of entries inserted over time
    pub inserts: u64,
    /// Total number of entries deleted over time
    pub deletes: u64,
    /// Number of entries updated in place over time
    pub updates: u64,
    /// Number of inserts failed due to a collision
    pub collisions: u64,
    /// Number of updates failed due to a missing entry
    pub update_misses: u64,
    /// Number of deletes failed due to a missing entry
    pub delete_misses: u64,
    /// Number of inserts that failed due to space exhaustion
    pub exhaustion: u64,
}

impl TableUsage {
    /// Initialize a TableUsage structure with the provided size
    pub fn new(size: u32) -> TableUsage {
        TableUsage {
            size,
            ..Default::default()
        }
    }
}

/// Does an object installed for `outer` also cover `inner`?
pub(crate) fn covers(outer: PipeTarget, inner: PipeTarget) -> bool {
    outer == PipeTarget::All || outer == inner
}

/// The entries of a table that stores them.
pub struct EntryStore<E> {
    pub(crate) ids: IdAllocator,
    pub(crate) entries: BTreeMap<EntryHdl, E>,
    /// Member id (action data) or group id (selector) to entry handle
    pub(crate) by_id: HashMap<u32, EntryHdl>,
    /// One index per pipeline replica
    pub(crate) key_htbls: Vec<KeyIndex>,
}

impl<E> EntryStore<E> {
    fn new(log: &slog::Logger, ctx: &TableContext, num_htbls: usize) -> Self {
        EntryStore {
            ids: IdAllocator::new(log, &ctx.name),
            entries: BTreeMap::new(),
            by_id: HashMap::new(),
            key_htbls: (0..num_htbls)
                .map(|_| KeyIndex::new(ctx.flags.duplicate_entry_check))
                .collect(),
        }
    }

    fn reset(&mut self) {
        self.ids.reset();
        self.entries.clear();
        self.by_id.clear();
        self.key_htbls.iter_mut().for_each(|k| k.clear());
    }

    pub fn get(&self, hdl: EntryHdl) -> PipeMgrResult<&E> {
        self.entries
            .get(&hdl)
            .ok_or_else(|| PipeMgrError::NotFound(format!("entry {hdl}")))
    }

    pub fn get_mut(&mut self, hdl: EntryHdl) -> PipeMgrResult<&mut E> {
        self.entries
            .get_mut(&hdl)
            .ok_or_else(|| PipeMgrError::NotFound(format!("entry {hdl}")))
    }

    /// Find an entry by its member or group id
    pub fn hdl_by_id(&self, id: u32) -> Option<EntryHdl> {
        self.by_id.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry holding this key in any of the given replicas
    pub fn key_lookup(
        &self,
        replicas: Range<usize>,
        key: &MatchKey,
    ) -> Option<EntryHdl> {
        replicas
            .filter_map(|r| self.key_htbls[r].lookup(key))
            .next()
    }

    pub fn key_collides(&self, replicas: Range<usize>, key: &MatchKey) -> bool {
        replicas.into_iter().any(|r| self.key_htbls[r].collides(key))
    }

    fn key_remove(
        &mut self,
        replicas: Range<usize>,
        key: &MatchKey,
        hdl: EntryHdl,
    ) {
        for r in replicas {
            self.key_htbls[r].remove(key, hdl);
        }
    }

    fn key_insert(
        &mut self,
        replicas: Range<usize>,
        key: &MatchKey,
        hdl: EntryHdl,
    ) -> PipeMgrResult<()> {
        for r in replicas.clone() {
            if let Err(e) = self.key_htbls[r].insert(key.clone(), hdl) {
                self.key_remove(replicas.start..r, key, hdl);
                return Err(e);
            }
        }
        Ok(())
    }

    // Return a handle to the allocator while unwinding from `initial`.
    fn unwind_hdl(
        &mut self,
        hdl: EntryHdl,
        initial: PipeMgrError,
    ) -> PipeMgrError {
        match self.ids.release(hdl) {
            Ok(()) => initial,
            Err(e) => PipeMgrError::unwind(initial, e),
        }
    }

    /// Allocate a handle, index `key` under it in each of the given replicas,
    /// and then construct the entry.  If any step fails, every earlier step is
    /// undone before the error is returned.
    pub(crate) fn insert_with<F>(
        &mut self,
        replicas: Range<usize>,
        key: Option<&MatchKey>,
        build: F,
    ) -> PipeMgrResult<EntryHdl>
    where
        F: FnOnce(EntryHdl) -> PipeMgrResult<E>,
    {
        let hdl = self.ids.allocate()?;
        if let Some(key) = key {
            if let Err(e) = self.key_insert(replicas.clone(), key, hdl) {
                return Err(self.unwind_hdl(hdl, e));
            }
        }
        match build(hdl) {
            Ok(entry) => {
                self.entries.insert(hdl, entry);
                Ok(hdl)
            }
            Err(e) => {
                if let Some(key) = key {
                    self.key_remove(replicas, key, hdl);
                }
                Err(self.unwind_hdl(hdl, e))
            }
        }
    }

    /// Remove an entry and every index pointing at it: its key in each of
    /// the given replicas and the member or group id it was added under.
    pub(crate) fn remove(
        &mut self,
        hdl: EntryHdl,
        replicas: Range<usize>,
        key: Option<&MatchKey>,
        id: Option<u32>,
    ) -> PipeMgrResult<E> {
        let entry = self
            .entries
            .remove(&hdl)
            .ok_or_else(|| PipeMgrError::NotFound(format!("entry {hdl}")))?;
        if let Some(key) = key {
            self.key_remove(replicas, key, hdl);
        }
        if let Some(id) = id {
            if self.by_id.get(&id) == Some(&hdl) {
                self.by_id.remove(&id);
            }
        }
        self.ids.release(hdl)?;
        Ok(entry)
    }

    /// Entry handles following `after` (or from the start), in handle order
    pub fn handles(&self, after: Option<EntryHdl>, n: usize) -> Vec<EntryHdl> {
        let start = match after {
            Some(h) => Bound::Excluded(h),
            None => Bound::Unbounded,
        };
        self.entries
            .range((start, Bound::Unbounded))
            .take(n)
            .map(|(h, _)| *h)
            .collect()
    }
}

/// Everything about a table that changes at runtime
pub struct TableState<E> {
    pub usage: TableUsage,
    /// Absent when the table's schema disables entry storage
    pub store: Option<EntryStore<E>>,
}

/// A table, its context, and its lock-protected state
pub struct Table<E> {
    pub ctx: Arc<TableContext>,
    /// The descriptor handed to the driver on every call
    pub dal: DalTable,
    pub(crate) log: slog::Logger,
    num_pipes: u16,
    state: Mutex<TableState<E>>,
}

/// A table along with its held lock
pub(crate) struct Locked<'a, E> {
    pub table: &'a Table<E>,
    pub state: MutexGuard<'a, TableState<E>>,
}

impl<E> Table<E> {
    pub fn new(
        log: &slog::Logger,
        ctx: Arc<TableContext>,
        num_pipes: u16,
    ) -> Self {
        let log = log.new(o!("unit" => "table", "table" => ctx.name.clone()));
        let store = ctx
            .flags
            .store_entries
            .then(|| EntryStore::new(&log, &ctx, num_pipes as usize));
        Table {
            dal: ctx.dal_table(),
            state: Mutex::new(TableState {
                usage: TableUsage::new(ctx.size),
                store,
            }),
            ctx,
            log,
            num_pipes,
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn handle(&self) -> TableHdl {
        self.ctx.handle
    }

    pub(crate) fn lock(&self) -> Locked<'_, E> {
        Locked {
            table: self,
            state: self.state.lock(),
        }
    }

    pub(crate) fn not_stored(&self) -> PipeMgrError {
        PipeMgrError::NotStored(self.ctx.name.clone())
    }

    /// The indexes of the replicas addressed by a target
    pub fn replicas(&self, target: PipeTarget) -> PipeMgrResult<Range<usize>> {
        match target {
            PipeTarget::All => Ok(0..self.num_pipes as usize),
            PipeTarget::Pipe(p) if p < self.num_pipes => {
                Ok(p as usize..p as usize + 1)
            }
            PipeTarget::Pipe(p) => Err(PipeMgrError::Invalid(format!(
                "pipe {p} out of range for {}",
                self.ctx.name
            ))),
        }
    }

    /// Remove every entry from the table, in the driver and here.
    pub(crate) fn clear(
        &self,
        state: &mut TableState<E>,
        driver: &dyn DalOps,
    ) -> PipeMgrResult<()> {
        driver.table_clear(&self.dal)?;
        if let Some(store) = state.store.as_mut() {
            state.usage.deletes += store.len() as u64;
            store.reset();
        }
        state.usage.occupancy = 0;
        slog::debug!(self.log, "cleared");
        Ok(())
    }
}

impl<E> TableState<E> {
    pub(crate) fn stored(
        &mut self,
        name: &str,
    ) -> PipeMgrResult<&mut EntryStore<E>> {
        self.store
            .as_mut()
            .ok_or_else(|| PipeMgrError::NotStored(name.to_string()))
    }

    /// Fail with `TableFull` if the store can't take another entry
    pub(crate) fn check_space(
        &mut self,
        ctx: &TableContext,
    ) -> PipeMgrResult<()> {
        let full = match &self.store {
            Some(s) => s.len() >= ctx.size as usize,
            None => false,
        };
        if full {
            self.usage.exhaustion += 1;
            Err(PipeMgrError::TableFull(ctx.name.clone()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn count_insert(&mut self) {
        self.usage.occupancy += 1;
        self.usage.inserts += 1;
    }

    pub(crate) fn count_delete(&mut self) {
        self.usage.occupancy = self.usage.occupancy.saturating_sub(1);
        self.usage.deletes += 1;
    }
}

/// Lock two tables in handle order
pub(crate) fn lock_two<'a, A, B>(
    a: &'a Table<A>,
    b: &'a Table<B>,
) -> (Locked<'a, A>, Locked<'a, B>) {
    if a.handle() < b.handle() {
        let la = a.lock();
        (la, b.lock())
    } else {
        let lb = b.lock();
        (a.lock(), lb)
    }
}

/// The operations common to every kind of table, independent of what its
/// entries hold.
pub trait TableOps: Send + Sync {
    fn context(&self) -> &Arc<TableContext>;

    fn usage(&self) -> TableUsage;

    /// Number of entries in the table
    fn count(&self) -> PipeMgrResult<usize>;

    /// The lowest live entry handle
    fn get_first(&self) -> PipeMgrResult<Option<EntryHdl>>;

    /// Up to `n` live entry handles following `hdl`, which must be live
    fn get_next_n(
        &self,
        hdl: EntryHdl,
        n: usize,
    ) -> PipeMgrResult<Vec<EntryHdl>>;
}

impl<E: Send> TableOps for Table<E> {
    fn context(&self) -> &Arc<TableContext> {
        &self.ctx
    }

    fn usage(&self) -> TableUsage {
        self.state.lock().usage.clone()
    }

    fn count(&self) -> PipeMgrResult<usize> {
        let mut l = self.lock();
        Ok(l.state.stored(self.name())?.len())
    }

    fn get_first(&self) -> PipeMgrResult<Option<EntryHdl>> {
        let mut l = self.lock();
        Ok(l.state.stored(self.name())?.handles(None, 1).first().copied())
    }

    fn get_next_n(
        &self,
        hdl: EntryHdl,
        n: usize,
    ) -> PipeMgrResult<Vec<EntryHdl>> {
        let mut l = self.lock();
        let store = l.state.stored(self.name())?;
        store.get(hdl)?;
        Ok(store.handles(Some(hdl), n))
    }
}

impl Pipeline {
    /// The generic view of any table in the pipeline
    pub fn table(&self, tbl_hdl: TableHdl) -> PipeMgrResult<&dyn TableOps> {
        if let Some(t) = self.mats.get(&tbl_hdl) {
            Ok(t)
        } else if let Some(t) = self.adts.get(&tbl_hdl) {
            Ok(t)
        } else if let Some(t) = self.sels.get(&tbl_hdl) {
            Ok(t)
        } else if let Some(t) = self.vls.get(&tbl_hdl) {
            Ok(t)
        } else {
            Err(PipeMgrError::NoSuchTable(format!("handle {tbl_hdl}")))
        }
    }

    pub fn table_usage(&self, tbl_hdl: TableHdl) -> PipeMgrResult<TableUsage> {
        Ok(self.table(tbl_hdl)?.usage())
    }

    pub fn table_count(&self, tbl_hdl: TableHdl) -> PipeMgrResult<usize> {
        self.table(tbl_hdl)?.count()
    }

    pub fn table_get_first(
        &self,
        tbl_hdl: TableHdl,
    ) -> PipeMgrResult<Option<EntryHdl>> {
        self.table(tbl_hdl)?.get_first()
    }

    pub fn table_get_next_n(
        &self,
        tbl_hdl: TableHdl,
        hdl: EntryHdl,
        n: usize,
    ) -> PipeMgrResult<Vec<EntryHdl>> {
        self.table(tbl_hdl)?.get_next_n(hdl, n)
    }

    /// Remove every entry from one table.  Clearing a table whose entries are
    /// still referenced by a match table fails with `InUse`.
    pub fn table_clear(&mut self, tbl_hdl: TableHdl) -> PipeMgrResult<()> {
        if self.mats.contains_key(&tbl_hdl) {
            self.mat_clear(tbl_hdl)
        } else if self.sels.contains_key(&tbl_hdl) {
            self.sel_clear(tbl_hdl)
        } else if self.adts.contains_key(&tbl_hdl) {
            self.adt_clear(tbl_hdl)
        } else if self.vls.contains_key(&tbl_hdl) {
            self.vl_clear(tbl_hdl)
        } else {
            Err(PipeMgrError::NoSuchTable(format!("handle {tbl_hdl}")))
        }
    }

    /// Remove every entry from every table.  Referencing tables are cleared
    /// before the tables they reference.
    pub fn clear_all(&mut self) -> PipeMgrResult<()> {
        let mats: Vec<TableHdl> = self.mats.keys().copied().collect();
        let sels: Vec<TableHdl> = self.sels.keys().copied().collect();
        let adts: Vec<TableHdl> = self.adts.keys().copied().collect();
        let vls: Vec<TableHdl> = self.vls.keys().copied().collect();
        for hdl in mats {
            self.mat_clear(hdl)?;
        }
        for hdl in sels {
            self.sel_clear(hdl)?;
        }
        for hdl in adts {
            self.adt_clear(hdl)?;
        }
        for hdl in vls {
            self.vl_clear(hdl)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aal::MatchEntryField;
    use aal::MatchSpec;
    use aal::ValueTypes;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    use crate::context::PipelineContext;

    fn context() -> Arc<TableContext> {
        let ctx = PipelineContext::parse(
            r#"{
                "program_name": "test",
                "compiler_version": "1.4.2",
                "schema_version": "1.1.0",
                "tables": [{
                    "name": "pipe.ingress.members",
                    "handle": 1,
                    "table_type": "match",
                    "size": 256,
                    "match_key_fields": [
                        { "name": "meta.id", "bit_width": 16,
                          "position": 0, "match_type": "exact" }
                    ]
                }]
            }"#,
        )
        .unwrap();
        ctx.table("pipe.ingress.members").unwrap().clone()
    }

    fn key(ctx: &TableContext, id: u16) -> MatchKey {
        let field = MatchEntryField::new("meta.id", ValueTypes::from(id));
        MatchKey::build(ctx, &MatchSpec::new(vec![field])).unwrap()
    }

    fn new_store(ctx: &TableContext) -> EntryStore<u16> {
        let log = common::logging::init(
            "test",
            &None,
            common::logging::LogFormat::Human,
        )
        .unwrap();
        EntryStore::new(&log, ctx, 2)
    }

    // Every live entry holds an issued handle and is reachable through each
    // of its indexes, and no handle is issued without an entry behind it.
    fn check(
        ctx: &TableContext,
        store: &EntryStore<u16>,
        live: &BTreeMap<EntryHdl, u16>,
    ) {
        assert_eq!(store.len(), live.len());
        assert_eq!(store.ids.in_use() as usize, store.len());
        assert_eq!(store.by_id.len(), store.len());
        for (hdl, id) in live {
            assert!(store.ids.is_allocated(*hdl), "handle {hdl}");
            assert_eq!(store.get(*hdl).ok(), Some(id));
            assert_eq!(store.hdl_by_id(u32::from(*id)), Some(*hdl));
            assert_eq!(store.key_lookup(0..2, &key(ctx, *id)), Some(*hdl));
        }
    }

    #[test]
    fn test_interleaved_add_delete() -> anyhow::Result<()> {
        let ctx = context();
        let mut store = new_store(&ctx);
        let mut live = BTreeMap::new();
        let mut rng = rand::thread_rng();

        for _ in 0..1000 {
            let id: u16 = rng.gen_range(0..48);
            let k = key(&ctx, id);
            let found = live.iter().find(|(_, v)| **v == id).map(|(h, _)| *h);
            match found {
                Some(hdl) => {
                    let e =
                        store.remove(hdl, 0..2, Some(&k), Some(id.into()))?;
                    assert_eq!(e, id);
                    live.remove(&hdl);
                    assert!(!store.ids.is_allocated(hdl));
                    assert_eq!(store.hdl_by_id(id.into()), None);
                    assert_eq!(store.key_lookup(0..2, &k), None);
                }
                None => {
                    let hdl = store.insert_with(0..2, Some(&k), |_| Ok(id))?;
                    store.by_id.insert(id.into(), hdl);
                    live.insert(hdl, id);
                }
            }
            check(&ctx, &store, &live);
        }

        store.reset();
        live.clear();
        check(&ctx, &store, &live);
        assert_eq!(store.ids.allocate()?, 0);
        Ok(())
    }

    #[test]
    fn test_failed_insert_unwinds() -> anyhow::Result<()> {
        let ctx = context();
        let mut store = new_store(&ctx);
        let mut live = BTreeMap::new();

        let k = key(&ctx, 7);
        let hdl = store.insert_with(0..2, Some(&k), |_| Ok(7))?;
        store.by_id.insert(7, hdl);
        live.insert(hdl, 7);

        let k = key(&ctx, 8);
        let r = store.insert_with(0..2, Some(&k), |_| {
            Err(PipeMgrError::Invalid("rejected".into()))
        });
        assert!(matches!(r, Err(PipeMgrError::Invalid(_))));
        assert_eq!(store.key_lookup(0..2, &k), None);
        check(&ctx, &store, &live);

        // A duplicate key gives its handle back
        let k = key(&ctx, 7);
        let r = store.insert_with(0..2, Some(&k), |_| Ok(7));
        assert!(r.is_err());
        check(&ctx, &store, &live);

        // The freed handle is the next one issued
        let k = key(&ctx, 9);
        assert_eq!(store.insert_with(0..2, Some(&k), |_| Ok(9))?, hdl + 1);
        Ok(())
    }
}
