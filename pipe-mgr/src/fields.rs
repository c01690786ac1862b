// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Field-id based access to table keys and data.
//!
//! Northbound clients that don't want to deal in field names address key
//! fields and action parameters by the integer ids the context assigns them.
//! A [`TableKey`] or [`TableData`] is filled in one field at a time, checked
//! against the table's context as it goes, and then converted into the
//! match and action specs the table operations take.

use std::collections::BTreeMap;
use std::sync::Arc;

use aal::ActionArg;
use aal::MatchEntryField;
use aal::MatchEntryValue;
use aal::MatchLpm;
use aal::MatchMask;
use aal::MatchSpec;
use aal::MatchType;
use aal::ValueTypes;

use crate::codec::check_width;
use crate::context::ActionParam;
use crate::context::KeyField;
use crate::context::TableContext;
use crate::table::mat::ActionSpec;
use crate::types::*;

/// A match key under construction
#[derive(Debug, Clone)]
pub struct TableKey {
    ctx: Arc<TableContext>,
    fields: BTreeMap<u32, MatchEntryValue>,
    priority: u32,
}

fn wrong_kind(f: &KeyField, want: MatchType) -> PipeMgrError {
    PipeMgrError::SchemaMismatch(format!(
        "{} is a {} field, not {want}",
        f.name, f.match_type
    ))
}

impl TableKey {
    pub fn new(ctx: &Arc<TableContext>) -> Self {
        TableKey {
            ctx: ctx.clone(),
            fields: BTreeMap::new(),
            priority: 0,
        }
    }

    /// Set a field to match a single value exactly
    pub fn set_value(
        &mut self,
        id: u32,
        value: impl Into<ValueTypes>,
    ) -> PipeMgrResult<()> {
        let f = self.ctx.key_field_by_id(id)?;
        let value = value.into();
        check_width(&f.name, &value, f.bit_width as usize)?;
        self.fields.insert(id, MatchEntryValue::Value(value));
        Ok(())
    }

    /// Set a ternary field's value and mask
    pub fn set_value_mask(
        &mut self,
        id: u32,
        value: impl Into<ValueTypes>,
        mask: impl Into<ValueTypes>,
    ) -> PipeMgrResult<()> {
        let f = self.ctx.key_field_by_id(id)?;
        if f.match_type != MatchType::Ternary {
            return Err(wrong_kind(f, MatchType::Ternary));
        }
        let val = value.into();
        let mask = mask.into();
        check_width(&f.name, &val, f.bit_width as usize)?;
        check_width(&f.name, &mask, f.bit_width as usize)?;
        self.fields
            .insert(id, MatchEntryValue::Mask(MatchMask { val, mask }));
        Ok(())
    }

    /// Set an lpm field's prefix and prefix length
    pub fn set_value_lpm(
        &mut self,
        id: u32,
        prefix: impl Into<ValueTypes>,
        len: u16,
    ) -> PipeMgrResult<()> {
        let f = self.ctx.key_field_by_id(id)?;
        if f.match_type != MatchType::Lpm {
            return Err(wrong_kind(f, MatchType::Lpm));
        }
        let width = f.bit_width as usize;
        if len as usize > width {
            return Err(PipeMgrError::InvalidWidth {
                field: f.name.clone(),
                bits: len as usize,
                width,
            });
        }
        let prefix = prefix.into();
        check_width(&f.name, &prefix, width)?;
        self.fields
            .insert(id, MatchEntryValue::Lpm(MatchLpm { prefix, len }));
        Ok(())
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    /// The value of a field, if it has been set
    pub fn get_value(
        &self,
        id: u32,
    ) -> PipeMgrResult<Option<&MatchEntryValue>> {
        self.ctx.key_field_by_id(id)?;
        Ok(self.fields.get(&id))
    }

    pub fn to_match_spec(&self) -> MatchSpec {
        let fields = self
            .ctx
            .key_fields
            .iter()
            .filter_map(|f| {
                self.fields.get(&f.id()).map(|v| MatchEntryField {
                    name: f.name.clone(),
                    value: v.clone(),
                })
            })
            .collect();
        MatchSpec::new(fields).with_priority(self.priority)
    }

    pub fn from_match_spec(
        ctx: &Arc<TableContext>,
        spec: &MatchSpec,
    ) -> PipeMgrResult<Self> {
        let mut key = TableKey::new(ctx);
        for mf in &spec.fields {
            let f = ctx.key_field(&mf.name).ok_or_else(|| {
                PipeMgrError::SchemaMismatch(format!(
                    "{} is not a key field of {}",
                    mf.name, ctx.name
                ))
            })?;
            key.fields.insert(f.id(), mf.value.clone());
        }
        key.priority = spec.priority;
        Ok(key)
    }
}

/// Action parameters, or value-lookup data, under construction
#[derive(Debug, Clone)]
pub struct TableData {
    act_fn_hdl: Option<ActFnHdl>,
    params: Vec<ActionParam>,
    values: BTreeMap<u32, ValueTypes>,
}

impl TableData {
    /// Data for one of a table's actions
    pub fn for_action(
        ctx: &TableContext,
        act_fn_hdl: ActFnHdl,
    ) -> PipeMgrResult<Self> {
        let act = ctx.action(act_fn_hdl)?;
        Ok(TableData {
            act_fn_hdl: Some(act_fn_hdl),
            params: act.params.clone(),
            values: BTreeMap::new(),
        })
    }

    /// Data for a value-lookup table
    pub fn for_values(ctx: &TableContext) -> Self {
        TableData {
            act_fn_hdl: None,
            params: ctx.data_fields.clone(),
            values: BTreeMap::new(),
        }
    }

    fn param(&self, id: u32) -> PipeMgrResult<&ActionParam> {
        self.params
            .iter()
            .find(|p| p.id() == id)
            .ok_or(PipeMgrError::UnknownField(id))
    }

    pub fn set(
        &mut self,
        id: u32,
        value: impl Into<ValueTypes>,
    ) -> PipeMgrResult<()> {
        let p = self.param(id)?;
        let value = value.into();
        check_width(&p.name, &value, p.bit_width as usize)?;
        self.values.insert(id, value);
        Ok(())
    }

    pub fn get(&self, id: u32) -> PipeMgrResult<Option<&ValueTypes>> {
        self.param(id)?;
        Ok(self.values.get(&id))
    }

    /// The values set so far, as named arguments in field-id order
    pub fn to_args(&self) -> Vec<ActionArg> {
        self.values
            .iter()
            .filter_map(|(id, v)| {
                self.params.iter().find(|p| p.id() == *id).map(|p| ActionArg {
                    name: p.name.clone(),
                    value: v.clone(),
                })
            })
            .collect()
    }

    pub fn to_action_spec(&self) -> PipeMgrResult<ActionSpec> {
        let act_fn_hdl = self.act_fn_hdl.ok_or_else(|| {
            PipeMgrError::SchemaMismatch(
                "value-lookup data has no action".into(),
            )
        })?;
        Ok(ActionSpec::Direct {
            act_fn_hdl,
            args: self.to_args(),
        })
    }
}
