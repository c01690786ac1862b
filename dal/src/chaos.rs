// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use std::collections::HashMap;

use rand::random;
use serde::{Deserialize, Serialize};
use slog::Logger;

use aal::{
    CounterData, DalData, DalEntry, DalError, DalOps, DalResult, DalTable,
    MatchSpec, PipeTarget,
};

use crate::stub::StubDal;

/// Chaos that happens according to a probability.
#[derive(Default, Debug, Serialize, Deserialize, Copy, Clone, PartialEq)]
#[serde(transparent)]
pub struct Chaos {
    /// A probability between 0.0 and 1.0
    pub value: f64,
}

impl Chaos {
    /// Create a new chaos value.
    pub fn new(value: f64) -> Self {
        let mut c = Self::default();
        c.set(value);
        c
    }

    /// Set the chaos value. Panics if value is outside the range [0.0, 1.0].
    pub fn set(&mut self, value: f64) {
        if !(0.0..=1.0).contains(&value) {
            panic!("probability out of range");
        }
        self.value = value;
    }

    /// Get the underlying chaos value.
    pub fn get(&self) -> f64 {
        self.value
    }

    /// Return a chaos error according to the underlying probability value.
    /// A probability of 0.0 never fails and 1.0 always does.
    pub fn unfurled(&self, log: &Logger, message: &str) -> DalResult<()> {
        if self.value > random::<f64>() {
            slog::error!(log, "chaos error: {}", message);
            return Err(DalError::Synthetic(message.into()));
        }
        Ok(())
    }
}

/// A form of chaos that applies to tables.  Tables without their own entry
/// fall back to the default probability.
#[derive(Default, Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TableChaos {
    #[serde(default)]
    pub default: Chaos,
    /// Track a set of chaos probabilities keyed by table name.
    #[serde(default)]
    pub values: HashMap<String, f64>,
}

/// A convenience function for creating chaos tables.
#[macro_export]
macro_rules! table_chaos {
    ( $( ($entry:expr, $prob:expr) ),* ) => {
        $crate::chaos::TableChaos {
            default: $crate::chaos::Chaos::default(),
            values: std::collections::HashMap::from([
                $( ($entry.into(), $prob) ),*
            ])
        }
    }
}

impl TableChaos {
    /// Create a chaos table that applies the same probability to every table.
    pub fn uniform(v: f64) -> Self {
        TableChaos {
            default: Chaos::new(v),
            values: HashMap::new(),
        }
    }

    /// Return a chaos error according to the underlying probability value for
    /// the given table `id`.
    pub fn unfurled(
        &self,
        log: &Logger,
        id: &str,
        message: &str,
    ) -> DalResult<()> {
        let value = self.values.get(id).copied().unwrap_or(self.default.value);
        if value > random::<f64>() {
            slog::error!(log, "chaos table error: {}", message; "table" => id);
            return Err(DalError::Synthetic(message.into()));
        }
        Ok(())
    }

    fn validate(&self, name: &str) -> DalResult<()> {
        std::iter::once(&self.default.value)
            .chain(self.values.values())
            .all(|v| (0.0..=1.0).contains(v))
            .then_some(())
            .ok_or(DalError::InvalidArg(format!(
                "{name}: probability out of range"
            )))
    }
}

/// The chaos driver config contains chaos values for each driver operation.
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ChaosConfig {
    pub table_init: TableChaos,
    pub table_clear: TableChaos,
    pub entry_add: TableChaos,
    pub entry_update: TableChaos,
    pub entry_del: TableChaos,
    pub group_add: TableChaos,
    pub group_del: TableChaos,
    pub group_member_add: TableChaos,
    pub group_member_del: TableChaos,
    pub counter_get: Chaos,
    pub counter_clear: Chaos,
}

impl ChaosConfig {
    /// The uniform chaos config applies a uniform underlying probability to
    /// each chaos value.
    pub fn uniform(v: f64) -> Self {
        Self {
            table_init: TableChaos::uniform(v),
            table_clear: TableChaos::uniform(v),
            entry_add: TableChaos::uniform(v),
            entry_update: TableChaos::uniform(v),
            entry_del: TableChaos::uniform(v),
            group_add: TableChaos::uniform(v),
            group_del: TableChaos::uniform(v),
            group_member_add: TableChaos::uniform(v),
            group_member_del: TableChaos::uniform(v),
            counter_get: Chaos::new(v),
            counter_clear: Chaos::new(v),
        }
    }

    /// The mutation chaos config applies a uniform probability to every
    /// operation that changes table state.  Table setup and counter access
    /// never fail.
    pub fn uniform_mutate(v: f64) -> Self {
        Self {
            entry_add: TableChaos::uniform(v),
            entry_update: TableChaos::uniform(v),
            entry_del: TableChaos::uniform(v),
            group_add: TableChaos::uniform(v),
            group_del: TableChaos::uniform(v),
            group_member_add: TableChaos::uniform(v),
            group_member_del: TableChaos::uniform(v),
            ..Default::default()
        }
    }

    fn validate(&self) -> DalResult<()> {
        self.table_init.validate("table_init")?;
        self.table_clear.validate("table_clear")?;
        self.entry_add.validate("entry_add")?;
        self.entry_update.validate("entry_update")?;
        self.entry_del.validate("entry_del")?;
        self.group_add.validate("group_add")?;
        self.group_del.validate("group_del")?;
        self.group_member_add.validate("group_member_add")?;
        self.group_member_del.validate("group_member_del")?;
        for (name, c) in [
            ("counter_get", &self.counter_get),
            ("counter_clear", &self.counter_clear),
        ] {
            if !(0.0..=1.0).contains(&c.value) {
                return Err(DalError::InvalidArg(format!(
                    "{name}: probability out of range"
                )));
            }
        }
        Ok(())
    }
}

/// A driver that keeps its state exactly as the stub driver does, but
/// injects failures into each operation according to its [`ChaosConfig`].
pub struct ChaosDal {
    log: Logger,
    config: ChaosConfig,
    inner: StubDal,
}

impl ChaosDal {
    pub fn new(log: &Logger, config: &ChaosConfig) -> DalResult<Self> {
        config.validate()?;
        Ok(ChaosDal {
            log: log.new(slog::o!("unit" => "chaos_dal")),
            config: config.clone(),
            inner: StubDal::new(log),
        })
    }

    /// The stub model underneath the chaos.
    pub fn stub(&self) -> &StubDal {
        &self.inner
    }
}

/// A convenience macro for unfurling scalar chaos. The $name should be a
/// `Chaos` member of [`ChaosConfig`].
macro_rules! unfurl {
    ($handle:ident, $name:ident) => {
        $handle
            .config
            .$name
            .unfurled(&$handle.log, stringify!($name))?
    };
}

/// A convenience macro for unfurling tabular chaos. The $name should be a
/// `TableChaos` member of [`ChaosConfig`].
macro_rules! table_unfurl {
    ($handle:ident, $table:expr, $name:ident) => {
        $handle.config.$name.unfurled(
            &$handle.log,
            &$table.name,
            stringify!($name),
        )?
    };
}

impl DalOps for ChaosDal {
    fn table_init(&self, table: &DalTable) -> DalResult<()> {
        table_unfurl!(self, table, table_init);
        self.inner.table_init(table)
    }

    fn table_clear(&self, table: &DalTable) -> DalResult<()> {
        table_unfurl!(self, table, table_clear);
        self.inner.table_clear(table)
    }

    fn entry_add(
        &self,
        table: &DalTable,
        target: PipeTarget,
        entry: &DalEntry,
    ) -> DalResult<DalData> {
        table_unfurl!(self, table, entry_add);
        self.inner.entry_add(table, target, entry)
    }

    fn entry_update(
        &self,
        table: &DalTable,
        target: PipeTarget,
        data: &DalData,
        entry: &DalEntry,
    ) -> DalResult<()> {
        table_unfurl!(self, table, entry_update);
        self.inner.entry_update(table, target, data, entry)
    }

    fn entry_del(
        &self,
        table: &DalTable,
        target: PipeTarget,
        data: &DalData,
    ) -> DalResult<()> {
        table_unfurl!(self, table, entry_del);
        self.inner.entry_del(table, target, data)
    }

    fn entry_del_by_key(
        &self,
        table: &DalTable,
        target: PipeTarget,
        key: &MatchSpec,
    ) -> DalResult<()> {
        table_unfurl!(self, table, entry_del);
        self.inner.entry_del_by_key(table, target, key)
    }

    fn group_add(
        &self,
        table: &DalTable,
        target: PipeTarget,
        grp_id: u32,
        max_grp_size: u32,
    ) -> DalResult<DalData> {
        table_unfurl!(self, table, group_add);
        self.inner.group_add(table, target, grp_id, max_grp_size)
    }

    fn group_del(
        &self,
        table: &DalTable,
        target: PipeTarget,
        grp: &DalData,
    ) -> DalResult<()> {
        table_unfurl!(self, table, group_del);
        self.inner.group_del(table, target, grp)
    }

    fn group_member_add(
        &self,
        table: &DalTable,
        target: PipeTarget,
        grp: &DalData,
        mbr_id: u32,
    ) -> DalResult<()> {
        table_unfurl!(self, table, group_member_add);
        self.inner.group_member_add(table, target, grp, mbr_id)
    }

    fn group_member_del(
        &self,
        table: &DalTable,
        target: PipeTarget,
        grp: &DalData,
        mbr_id: u32,
    ) -> DalResult<()> {
        table_unfurl!(self, table, group_member_del);
        self.inner.group_member_del(table, target, grp, mbr_id)
    }

    fn counter_get(&self, name: &str, index: u32) -> DalResult<CounterData> {
        unfurl!(self, counter_get);
        self.inner.counter_get(name, index)
    }

    fn counter_clear(&self, name: &str, index: u32) -> DalResult<()> {
        unfurl!(self, counter_clear);
        self.inner.counter_clear(name, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aal::TableType;

    fn table(name: &str) -> DalTable {
        DalTable {
            handle: 1,
            name: name.into(),
            target_name: name.into(),
            table_type: TableType::Action,
            size: 4,
        }
    }

    fn member() -> DalEntry {
        DalEntry::ActionData {
            mbr_id: 1,
            act_fn_hdl: 2,
            data: vec![0xaa],
        }
    }

    #[test]
    fn test_certain_failure() -> anyhow::Result<()> {
        let log = crate::test_logger();
        let dal = ChaosDal::new(&log, &ChaosConfig::uniform_mutate(1.0))?;
        let t = table("adt");

        // Setup is untouched by the mutation chaos
        dal.table_init(&t)?;
        assert_eq!(
            dal.entry_add(&t, PipeTarget::All, &member()),
            Err(DalError::Synthetic("entry_add".into()))
        );
        assert!(dal.stub().entries(1).is_empty());
        Ok(())
    }

    #[test]
    fn test_per_table_chaos() -> anyhow::Result<()> {
        let log = crate::test_logger();
        let config = ChaosConfig {
            entry_add: table_chaos!(("flaky", 1.0)),
            ..Default::default()
        };
        let dal = ChaosDal::new(&log, &config)?;
        let flaky = table("flaky");
        let solid = DalTable {
            handle: 2,
            ..table("solid")
        };
        dal.table_init(&flaky)?;
        dal.table_init(&solid)?;

        assert!(dal.entry_add(&flaky, PipeTarget::All, &member()).is_err());
        dal.entry_add(&solid, PipeTarget::All, &member())?;
        Ok(())
    }

    #[test]
    fn test_config_parse() {
        let config: crate::DriverConfig = toml::from_str(
            r#"
            kind = "chaos"
            counter_get = 0.25
            [entry_add]
            default = 0.5
            values = { "pipe.ingress.fwd" = 1.0 }
            "#,
        )
        .unwrap();
        let crate::DriverConfig::Chaos(c) = config else {
            panic!("expected a chaos config");
        };
        assert_eq!(c.counter_get.get(), 0.25);
        assert_eq!(c.entry_add.default.get(), 0.5);
        assert_eq!(c.entry_add.values["pipe.ingress.fwd"], 1.0);
        assert_eq!(c.entry_del, TableChaos::default());

        let bad = ChaosConfig {
            counter_clear: Chaos { value: 1.5 },
            ..Default::default()
        };
        assert!(ChaosDal::new(&crate::test_logger(), &bad).is_err());
    }
}
