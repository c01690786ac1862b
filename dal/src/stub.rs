// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! A driver with no hardware behind it.  Entries and groups are recorded in
//! memory, so that tests and the admin tooling can observe what would have
//! been programmed.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use slog::{debug, o, trace};

use aal::{
    CounterData, DalData, DalEntry, DalError, DalOps, DalResult, DalTable,
    MatchSpec, PipeTarget,
};

#[derive(Debug, Clone)]
struct StubGroup {
    target: PipeTarget,
    grp_id: u32,
    max_grp_size: u32,
    mbrs: Vec<u32>,
}

#[derive(Debug, Default)]
struct StubTable {
    entries: BTreeMap<u64, (PipeTarget, DalEntry)>,
    groups: BTreeMap<u64, StubGroup>,
}

#[derive(Debug, Default)]
struct StubState {
    next_token: u64,
    tables: BTreeMap<u32, StubTable>,
    counters: BTreeMap<(String, u32), CounterData>,
}

impl StubState {
    fn token(&mut self) -> DalData {
        self.next_token += 1;
        DalData(self.next_token)
    }

    fn table(&mut self, table: &DalTable) -> DalResult<&mut StubTable> {
        self.tables.get_mut(&table.handle).ok_or_else(|| {
            DalError::Uninitialized(format!("table {}", table.name))
        })
    }
}

fn no_entry(table: &DalTable, data: &DalData) -> DalError {
    DalError::Missing(format!("entry {} in {}", data.0, table.name))
}

fn no_group(table: &DalTable, data: &DalData) -> DalError {
    DalError::Missing(format!("group {} in {}", data.0, table.name))
}

pub struct StubDal {
    log: slog::Logger,
    state: Mutex<StubState>,
}

impl StubDal {
    pub fn new(log: &slog::Logger) -> Self {
        StubDal {
            log: log.new(o!("unit" => "stub_dal")),
            state: Mutex::new(StubState::default()),
        }
    }

    /// The entries currently programmed into a table.
    pub fn entries(&self, table_hdl: u32) -> Vec<(PipeTarget, DalEntry)> {
        self.state
            .lock()
            .tables
            .get(&table_hdl)
            .map(|t| t.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The members of a group, in the order they were added.
    pub fn group_members(&self, table_hdl: u32, grp_id: u32) -> Vec<u32> {
        self.state
            .lock()
            .tables
            .get(&table_hdl)
            .and_then(|t| t.groups.values().find(|g| g.grp_id == grp_id))
            .map(|g| g.mbrs.clone())
            .unwrap_or_default()
    }

    /// Account for traffic against one cell of a counter, as the dataplane
    /// would.
    pub fn counter_bump(&self, name: &str, index: u32, pkts: u64, bytes: u64) {
        let mut state = self.state.lock();
        let cell = state
            .counters
            .entry((name.to_string(), index))
            .or_insert(CounterData {
                pkts: Some(0),
                bytes: Some(0),
            });
        cell.pkts = cell.pkts.map(|p| p + pkts);
        cell.bytes = cell.bytes.map(|b| b + bytes);
    }
}

impl DalOps for StubDal {
    fn table_init(&self, table: &DalTable) -> DalResult<()> {
        debug!(self.log, "init table {}", table.name;
            "handle" => table.handle, "size" => table.size);
        self.state
            .lock()
            .tables
            .insert(table.handle, StubTable::default());
        Ok(())
    }

    fn table_clear(&self, table: &DalTable) -> DalResult<()> {
        let mut state = self.state.lock();
        let t = state.table(table)?;
        t.entries.clear();
        t.groups.clear();
        Ok(())
    }

    fn entry_add(
        &self,
        table: &DalTable,
        target: PipeTarget,
        entry: &DalEntry,
    ) -> DalResult<DalData> {
        let mut state = self.state.lock();
        state.table(table)?;
        let data = state.token();
        state
            .table(table)?
            .entries
            .insert(data.0, (target, entry.clone()));
        trace!(self.log, "added {entry:?} to {}", table.name;
            "pipe" => %target, "token" => data.0);
        Ok(data)
    }

    fn entry_update(
        &self,
        table: &DalTable,
        _target: PipeTarget,
        data: &DalData,
        entry: &DalEntry,
    ) -> DalResult<()> {
        let mut state = self.state.lock();
        match state.table(table)?.entries.get_mut(&data.0) {
            Some((_, e)) => {
                *e = entry.clone();
                Ok(())
            }
            None => Err(no_entry(table, data)),
        }
    }

    fn entry_del(
        &self,
        table: &DalTable,
        _target: PipeTarget,
        data: &DalData,
    ) -> DalResult<()> {
        let mut state = self.state.lock();
        state
            .table(table)?
            .entries
            .remove(&data.0)
            .map(|_| ())
            .ok_or_else(|| no_entry(table, data))
    }

    fn entry_del_by_key(
        &self,
        table: &DalTable,
        target: PipeTarget,
        key: &MatchSpec,
    ) -> DalResult<()> {
        let mut state = self.state.lock();
        let t = state.table(table)?;
        let token = t
            .entries
            .iter()
            .find(|(_, (tgt, e))| {
                *tgt == target
                    && match e {
                        DalEntry::Match { key: k, .. }
                        | DalEntry::Value { key: k, .. } => k == key,
                        DalEntry::ActionData { .. } => false,
                    }
            })
            .map(|(token, _)| *token)
            .ok_or_else(|| {
                DalError::Missing(format!("no matching key in {}", table.name))
            })?;
        t.entries.remove(&token);
        Ok(())
    }

    fn group_add(
        &self,
        table: &DalTable,
        target: PipeTarget,
        grp_id: u32,
        max_grp_size: u32,
    ) -> DalResult<DalData> {
        let mut state = self.state.lock();
        state.table(table)?;
        let data = state.token();
        state.table(table)?.groups.insert(
            data.0,
            StubGroup {
                target,
                grp_id,
                max_grp_size,
                mbrs: Vec::new(),
            },
        );
        Ok(data)
    }

    fn group_del(
        &self,
        table: &DalTable,
        _target: PipeTarget,
        grp: &DalData,
    ) -> DalResult<()> {
        let mut state = self.state.lock();
        state
            .table(table)?
            .groups
            .remove(&grp.0)
            .map(|_| ())
            .ok_or_else(|| no_group(table, grp))
    }

    fn group_member_add(
        &self,
        table: &DalTable,
        target: PipeTarget,
        grp: &DalData,
        mbr_id: u32,
    ) -> DalResult<()> {
        let mut state = self.state.lock();
        let g = state
            .table(table)?
            .groups
            .get_mut(&grp.0)
            .ok_or_else(|| no_group(table, grp))?;
        if g.target != target {
            return Err(DalError::InvalidArg(format!(
                "group {} lives on pipe {}",
                g.grp_id, g.target
            )));
        }
        if g.mbrs.len() >= g.max_grp_size as usize {
            return Err(DalError::InvalidArg(format!(
                "group {} is full",
                g.grp_id
            )));
        }
        g.mbrs.push(mbr_id);
        Ok(())
    }

    fn group_member_del(
        &self,
        table: &DalTable,
        _target: PipeTarget,
        grp: &DalData,
        mbr_id: u32,
    ) -> DalResult<()> {
        let mut state = self.state.lock();
        let g = state
            .table(table)?
            .groups
            .get_mut(&grp.0)
            .ok_or_else(|| no_group(table, grp))?;
        match g.mbrs.iter().position(|m| *m == mbr_id) {
            Some(idx) => {
                g.mbrs.remove(idx);
                Ok(())
            }
            None => Err(DalError::Missing(format!(
                "member {mbr_id} in group {}",
                g.grp_id
            ))),
        }
    }

    fn counter_get(&self, name: &str, index: u32) -> DalResult<CounterData> {
        Ok(self
            .state
            .lock()
            .counters
            .get(&(name.to_string(), index))
            .copied()
            .unwrap_or(CounterData {
                pkts: Some(0),
                bytes: Some(0),
            }))
    }

    fn counter_clear(&self, name: &str, index: u32) -> DalResult<()> {
        self.state.lock().counters.remove(&(name.to_string(), index));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aal::{DalAction, MatchEntryField, TableType, ValueTypes};
    use pretty_assertions::assert_eq;

    fn table() -> DalTable {
        DalTable {
            handle: 1,
            name: "pipe.ingress.fwd".into(),
            target_name: "fwd".into(),
            table_type: TableType::Match,
            size: 16,
        }
    }

    fn entry(port: u16) -> DalEntry {
        DalEntry::Match {
            key: MatchSpec::new(vec![MatchEntryField::new(
                "port",
                ValueTypes::from(port),
            )]),
            action: DalAction::Member(7),
        }
    }

    #[test]
    fn test_entry_lifecycle() -> anyhow::Result<()> {
        let dal = StubDal::new(&crate::test_logger());
        let t = table();

        assert!(matches!(
            dal.entry_add(&t, PipeTarget::All, &entry(1)),
            Err(DalError::Uninitialized(_))
        ));

        dal.table_init(&t)?;
        let a = dal.entry_add(&t, PipeTarget::All, &entry(1))?;
        let b = dal.entry_add(&t, PipeTarget::Pipe(1), &entry(2))?;
        assert_ne!(a, b);
        assert_eq!(dal.entries(1).len(), 2);

        dal.entry_update(&t, PipeTarget::All, &a, &entry(3))?;
        assert_eq!(dal.entries(1)[0], (PipeTarget::All, entry(3)));

        dal.entry_del(&t, PipeTarget::All, &a)?;
        assert!(dal.entry_del(&t, PipeTarget::All, &a).is_err());

        let key = match entry(2) {
            DalEntry::Match { key, .. } => key,
            _ => unreachable!(),
        };
        assert!(dal.entry_del_by_key(&t, PipeTarget::All, &key).is_err());
        dal.entry_del_by_key(&t, PipeTarget::Pipe(1), &key)?;
        assert!(dal.entries(1).is_empty());
        Ok(())
    }

    #[test]
    fn test_groups() -> anyhow::Result<()> {
        let dal = StubDal::new(&crate::test_logger());
        let t = table();
        dal.table_init(&t)?;

        let g = dal.group_add(&t, PipeTarget::All, 5, 2)?;
        dal.group_member_add(&t, PipeTarget::All, &g, 10)?;
        dal.group_member_add(&t, PipeTarget::All, &g, 11)?;
        assert!(dal.group_member_add(&t, PipeTarget::All, &g, 12).is_err());
        assert_eq!(dal.group_members(1, 5), vec![10, 11]);

        dal.group_member_del(&t, PipeTarget::All, &g, 10)?;
        assert_eq!(dal.group_members(1, 5), vec![11]);
        dal.group_del(&t, PipeTarget::All, &g)?;
        assert!(dal.group_members(1, 5).is_empty());
        Ok(())
    }

    #[test]
    fn test_counters() -> anyhow::Result<()> {
        let dal = StubDal::new(&crate::test_logger());
        assert_eq!(dal.counter_get("c", 0)?.pkts, Some(0));
        dal.counter_bump("c", 0, 3, 300);
        dal.counter_bump("c", 0, 1, 100);
        assert_eq!(
            dal.counter_get("c", 0)?,
            CounterData {
                pkts: Some(4),
                bytes: Some(400)
            }
        );
        dal.counter_clear("c", 0)?;
        assert_eq!(dal.counter_get("c", 0)?.bytes, Some(0));
        Ok(())
    }
}
