// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! The compiled context of a pipeline: the static description of every table
//! and extern the program defines.  The context is produced by the compiler as
//! json, parsed once when a profile is loaded, and never modified afterward.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use semver::Version;
use semver::VersionReq;
use serde::Deserialize;
use serde::Serialize;

use aal::DalTable;
use aal::MatchType;
use aal::TableType;

use crate::codec;
use crate::types::*;

/// Context schema versions this library knows how to consume
pub const SUPPORTED_SCHEMA_VERSIONS: &str = ">=0.1.0, <2.0.0";

/// One field of a table's match key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyField {
    /// Fully qualified name, e.g. "hdr.ipv4.dst_addr"
    pub name: String,
    pub instance_name: String,
    pub field_name: String,
    /// Offset of this slice within the full header field
    pub start_bit: u32,
    pub bit_width: u32,
    pub bit_width_full: u32,
    pub position: u32,
    pub match_type: MatchType,
}

impl KeyField {
    /// Field id used by the field-id based accessors
    pub fn id(&self) -> u32 {
        self.position + 1
    }
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Network,
    Host,
}

/// Where a key field lives in the table's key buffer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KeyFormat {
    pub field_name: String,
    #[serde(default)]
    pub byte_order: ByteOrder,
    pub byte_array_index: u32,
    #[serde(default)]
    pub start_bit_offset: u32,
    pub bit_width: u32,
}

impl KeyFormat {
    /// Bit offset of the field from the start of the key buffer
    pub fn bit_offset(&self) -> usize {
        self.byte_array_index as usize * 8 + self.start_bit_offset as usize
    }

    fn end_bit(&self) -> usize {
        self.bit_offset() + self.bit_width as usize
    }
}

/// A parameter of an action, or a data field of a value-lookup table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActionParam {
    pub name: String,
    #[serde(default)]
    pub start_bit: u32,
    pub position: u32,
    pub bit_width: u32,
}

impl ActionParam {
    /// Field id used by the field-id based accessors
    pub fn id(&self) -> u32 {
        self.position + 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionFlags {
    pub allowed_as_hit: bool,
    pub allowed_as_default: bool,
    pub compiler_added: bool,
    pub constant_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionCtx {
    pub name: String,
    pub handle: ActFnHdl,
    pub params: Vec<ActionParam>,
    /// Length of the packed parameter blob
    pub data_len: usize,
    pub flags: ActionFlags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableFlags {
    /// Entries are tracked by the pipeline manager, not just the driver
    pub store_entries: bool,
    pub duplicate_entry_check: bool,
    pub add_on_miss: bool,
    pub idle_timeout_auto_delete: bool,
}

/// The immutable description of a single table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableContext {
    pub handle: TableHdl,
    pub name: String,
    pub target_name: String,
    pub direction: String,
    pub table_type: TableType,
    pub size: u32,
    pub flags: TableFlags,
    pub key_fields: Vec<KeyField>,
    pub key_format: Vec<KeyFormat>,
    /// Length of the value (or mask) half of a canonical key
    pub key_len: usize,
    pub has_ternary: bool,
    pub actions: Vec<ActionCtx>,
    pub default_action_handle: Option<ActFnHdl>,
    /// The action-data table holding this table's shared action data
    pub adt_ref: Option<TableHdl>,
    /// The selector table choosing among this table's action data
    pub sel_ref: Option<TableHdl>,
    pub max_group_size: u32,
    pub allow_duplicate_members: bool,
    pub data_fields: Vec<ActionParam>,
    pub data_len: usize,
}

impl TableContext {
    pub fn action(&self, hdl: ActFnHdl) -> PipeMgrResult<&ActionCtx> {
        self.actions.iter().find(|a| a.handle == hdl).ok_or_else(|| {
            PipeMgrError::SchemaMismatch(format!(
                "action {hdl} is not valid for {}",
                self.name
            ))
        })
    }

    pub fn action_by_name(&self, name: &str) -> Option<&ActionCtx> {
        self.actions
            .iter()
            .find(|a| a.name == name || get_short(&a.name) == name)
    }

    pub fn key_field(&self, name: &str) -> Option<&KeyField> {
        self.key_fields.iter().find(|f| f.name == name)
    }

    pub fn key_field_by_id(&self, id: u32) -> PipeMgrResult<&KeyField> {
        self.key_fields
            .iter()
            .find(|f| f.id() == id)
            .ok_or(PipeMgrError::UnknownField(id))
    }

    pub fn key_format(&self, name: &str) -> Option<&KeyFormat> {
        self.key_format.iter().find(|f| f.field_name == name)
    }

    /// The fields that contribute to the canonical key.  Selector fields feed
    /// the selector hash instead.
    pub fn match_fields(&self) -> impl Iterator<Item = &KeyField> {
        self.key_fields
            .iter()
            .filter(|f| f.match_type != MatchType::Selector)
    }

    pub fn dal_table(&self) -> DalTable {
        DalTable {
            handle: self.handle,
            name: self.name.clone(),
            target_name: self.target_name.clone(),
            table_type: self.table_type,
            size: self.size,
        }
    }
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CounterType {
    Packets,
    Bytes,
    #[default]
    PacketsAndBytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "extern_type", rename_all = "lowercase")]
pub enum ExternKind {
    Counter {
        #[serde(default)]
        counter_type: CounterType,
        size: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExternContext {
    pub name: String,
    #[serde(default)]
    pub target_name: String,
    #[serde(flatten)]
    pub kind: ExternKind,
}

/// Everything the compiler told us about one pipeline
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub program_name: String,
    pub compiler_version: Version,
    pub schema_version: Version,
    pub arch_name: String,
    pub tables: Vec<Arc<TableContext>>,
    pub externs: Vec<ExternContext>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawContext {
    program_name: String,
    compiler_version: String,
    schema_version: String,
    #[serde(default)]
    arch_name: String,
    #[serde(default)]
    tables: Vec<RawTable>,
    #[serde(default)]
    externs: Vec<ExternContext>,
}

#[derive(Debug, Deserialize)]
struct RawTable {
    name: String,
    target_name: Option<String>,
    #[serde(default)]
    direction: String,
    handle: u32,
    table_type: TableType,
    size: u32,
    #[serde(default)]
    add_on_miss: bool,
    #[serde(default)]
    idle_timeout_with_auto_delete: bool,
    #[serde(default = "yes")]
    store_entries: bool,
    #[serde(default = "yes")]
    duplicate_entry_check: bool,
    default_action_handle: Option<u32>,
    #[serde(default)]
    match_key_fields: Vec<RawKeyField>,
    match_key_format: Option<Vec<KeyFormat>>,
    #[serde(default)]
    actions: Vec<RawAction>,
    #[serde(default)]
    action_data_table_refs: Vec<String>,
    #[serde(default)]
    selection_table_refs: Vec<String>,
    #[serde(default)]
    max_group_size: u32,
    #[serde(default)]
    allow_duplicate_members: bool,
    #[serde(default)]
    data_fields: Vec<ActionParam>,
}

#[derive(Debug, Deserialize)]
struct RawKeyField {
    name: String,
    instance_name: Option<String>,
    field_name: Option<String>,
    #[serde(default)]
    start_bit: u32,
    bit_width: u32,
    bit_width_full: Option<u32>,
    position: u32,
    match_type: MatchType,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    name: String,
    handle: u32,
    #[serde(default)]
    p4_parameters: Vec<ActionParam>,
    #[serde(default = "yes")]
    allowed_as_hit_action: bool,
    #[serde(default = "yes")]
    allowed_as_default_action: bool,
    #[serde(default)]
    is_compiler_added_action: bool,
    #[serde(default)]
    constant_default_action: bool,
}

// For multi-segment names (e.g., aaaa.bbb.ccc.dddd) return the last segment
pub(crate) fn get_short(full: &str) -> &str {
    match full.rfind('.') {
        Some(p) => &full[p + 1..],
        None => full,
    }
}

fn schema_err(table: &str, msg: impl std::fmt::Display) -> PipeMgrError {
    PipeMgrError::Schema(format!("{table}: {msg}"))
}

// Verify that a set of parameters has unique names and positions, and that no
// two of them claim the same bits.
fn check_params(owner: &str, params: &[ActionParam]) -> PipeMgrResult<()> {
    let mut names = BTreeSet::new();
    let mut positions = BTreeSet::new();
    let mut spans: Vec<(u32, u32)> = Vec::new();
    for p in params {
        if p.bit_width == 0 {
            return Err(schema_err(owner, format!("{} has no width", p.name)));
        }
        if !names.insert(&p.name) || !positions.insert(p.position) {
            return Err(schema_err(owner, format!("{} is duplicated", p.name)));
        }
        spans.push((p.start_bit, p.start_bit + p.bit_width));
    }
    spans.sort();
    if spans.windows(2).any(|w| w[0].1 > w[1].0) {
        return Err(schema_err(owner, "overlapping parameters"));
    }
    Ok(())
}

fn convert_key_fields(
    table: &str,
    raw: Vec<RawKeyField>,
) -> PipeMgrResult<Vec<KeyField>> {
    let mut positions = BTreeSet::new();
    let mut fields = Vec::with_capacity(raw.len());
    for k in raw {
        if k.bit_width == 0 {
            return Err(schema_err(table, format!("{} has no width", k.name)));
        }
        if !positions.insert(k.position) {
            return Err(schema_err(
                table,
                format!("key position {} is duplicated", k.position),
            ));
        }
        let (instance, field) = match k.name.rfind('.') {
            Some(p) => (k.name[..p].to_string(), k.name[p + 1..].to_string()),
            None => (String::new(), k.name.clone()),
        };
        fields.push(KeyField {
            instance_name: k.instance_name.unwrap_or(instance),
            field_name: k.field_name.unwrap_or(field),
            start_bit: k.start_bit,
            bit_width: k.bit_width,
            bit_width_full: k.bit_width_full.unwrap_or(k.bit_width),
            position: k.position,
            match_type: k.match_type,
            name: k.name,
        });
    }
    fields.sort_by_key(|f| f.position);

    if fields.iter().filter(|f| f.match_type == MatchType::Lpm).count() > 1 {
        return Err(schema_err(table, "more than one lpm field"));
    }
    let mut names = BTreeSet::new();
    if let Some(f) = fields.iter().find(|f| !names.insert(&f.name)) {
        return Err(schema_err(table, format!("{} is duplicated", f.name)));
    }
    Ok(fields)
}

// When the compiler doesn't provide a key layout, each field starts on its own
// byte boundary, in position order.
fn derive_key_format(fields: &[KeyField]) -> Vec<KeyFormat> {
    let mut cursor = 0;
    fields
        .iter()
        .filter(|f| f.match_type != MatchType::Selector)
        .map(|f| {
            let fmt = KeyFormat {
                field_name: f.name.clone(),
                byte_order: ByteOrder::Network,
                byte_array_index: cursor,
                start_bit_offset: 0,
                bit_width: f.bit_width,
            };
            cursor += codec::bytes_for(f.bit_width as usize) as u32;
            fmt
        })
        .collect()
}

// Verify that every match field has a home in the key buffer, returning the
// length of the buffer.
fn check_key_format(
    table: &str,
    fields: &[KeyField],
    format: &[KeyFormat],
) -> PipeMgrResult<usize> {
    let mut spans = Vec::new();
    for f in fields.iter().filter(|f| f.match_type != MatchType::Selector) {
        let mut fmts = format.iter().filter(|k| k.field_name == f.name);
        let fmt = fmts.next().ok_or_else(|| {
            schema_err(table, format!("no key format for {}", f.name))
        })?;
        if fmts.next().is_some() {
            return Err(schema_err(
                table,
                format!("{} has multiple key formats", f.name),
            ));
        }
        if fmt.bit_width != f.bit_width {
            return Err(schema_err(
                table,
                format!("key format width mismatch for {}", f.name),
            ));
        }
        if fmt.start_bit_offset >= 8 {
            return Err(schema_err(
                table,
                format!("bit offset out of range for {}", f.name),
            ));
        }
        if fmt.byte_order == ByteOrder::Host
            && (fmt.start_bit_offset != 0 || fmt.bit_width % 8 != 0)
        {
            return Err(schema_err(
                table,
                format!("host-order field {} is not byte aligned", f.name),
            ));
        }
        spans.push((fmt.bit_offset(), fmt.end_bit()));
    }
    let known = |k: &&KeyFormat| fields.iter().any(|f| f.name == k.field_name);
    if let Some(k) = format.iter().find(|k| !known(k)) {
        return Err(schema_err(
            table,
            format!("key format names unknown field {}", k.field_name),
        ));
    }

    spans.sort();
    if spans.windows(2).any(|w| w[0].1 > w[1].0) {
        return Err(schema_err(table, "overlapping key fields"));
    }
    Ok(spans
        .iter()
        .map(|(_, end)| codec::bytes_for(*end))
        .max()
        .unwrap_or(0))
}

fn convert_actions(
    table: &str,
    raw: Vec<RawAction>,
) -> PipeMgrResult<Vec<ActionCtx>> {
    let mut handles = BTreeSet::new();
    let mut actions = Vec::with_capacity(raw.len());
    for a in raw {
        if !handles.insert(a.handle) {
            return Err(schema_err(
                table,
                format!("action handle {} is duplicated", a.handle),
            ));
        }
        check_params(&format!("{table}:{}", a.name), &a.p4_parameters)?;
        actions.push(ActionCtx {
            data_len: codec::data_len(&a.p4_parameters),
            params: a.p4_parameters,
            flags: ActionFlags {
                allowed_as_hit: a.allowed_as_hit_action,
                allowed_as_default: a.allowed_as_default_action,
                compiler_added: a.is_compiler_added_action,
                constant_default: a.constant_default_action,
            },
            name: a.name,
            handle: a.handle,
        });
    }
    Ok(actions)
}

impl PipelineContext {
    pub fn from_file(path: &Path) -> PipeMgrResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            PipeMgrError::Schema(format!(
                "reading context file {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&json)
    }

    /// Parse and validate a context document.
    pub fn parse(json: &str) -> PipeMgrResult<Self> {
        let raw: RawContext = serde_json::from_str(json)?;

        let parse_version = |what: &str, v: &str| {
            Version::parse(v).map_err(|e| {
                PipeMgrError::Schema(format!("bad {what} version {v}: {e}"))
            })
        };
        let compiler_version =
            parse_version("compiler", &raw.compiler_version)?;
        let schema_version = parse_version("schema", &raw.schema_version)?;
        let supported = VersionReq::parse(SUPPORTED_SCHEMA_VERSIONS)
            .map_err(|e| PipeMgrError::Schema(e.to_string()))?;
        if !supported.matches(&schema_version) {
            return Err(PipeMgrError::Schema(format!(
                "unsupported schema version {schema_version}"
            )));
        }

        // First pass: every table's name, handle, and type, so references can
        // be resolved regardless of the order tables appear in.
        let mut by_name: BTreeMap<String, (TableHdl, TableType)> =
            BTreeMap::new();
        let mut handles = BTreeSet::new();
        for t in &raw.tables {
            if !handles.insert(t.handle) {
                return Err(schema_err(
                    &t.name,
                    format!("table handle {} is duplicated", t.handle),
                ));
            }
            if t.handle == INVALID_HDL {
                return Err(schema_err(&t.name, "reserved table handle"));
            }
            if by_name
                .insert(t.name.clone(), (t.handle, t.table_type))
                .is_some()
            {
                return Err(schema_err(&t.name, "table name is duplicated"));
            }
        }
        let resolve = |table: &str,
                       refs: &[String],
                       want: TableType|
         -> PipeMgrResult<Option<TableHdl>> {
            if refs.len() > 1 {
                return Err(schema_err(table, format!("multiple {want} refs")));
            }
            refs.first()
                .map(|r| match by_name.get(r.as_str()) {
                    Some((hdl, tt)) if *tt == want => Ok(*hdl),
                    Some(_) => Err(schema_err(
                        table,
                        format!("{r} is not a {want} table"),
                    )),
                    None => Err(schema_err(
                        table,
                        format!("reference to unknown table {r}"),
                    )),
                })
                .transpose()
        };

        let mut tables = Vec::with_capacity(raw.tables.len());
        let mut sel_adts = BTreeMap::new();
        for t in &raw.tables {
            if t.table_type == TableType::Selection {
                let adt_ref = resolve(
                    &t.name,
                    &t.action_data_table_refs,
                    TableType::Action,
                )?;
                if adt_ref.is_none() {
                    return Err(schema_err(
                        &t.name,
                        "selector has no action data table",
                    ));
                }
                sel_adts.insert(t.handle, adt_ref);
            }
        }

        for t in raw.tables {
            let name = t.name.clone();
            let adt_ref =
                resolve(&name, &t.action_data_table_refs, TableType::Action)?;
            let sel_ref =
                resolve(&name, &t.selection_table_refs, TableType::Selection)?;

            match t.table_type {
                TableType::Match => {
                    if let Some(sel) = sel_ref {
                        if sel_adts.get(&sel).copied().flatten() != adt_ref {
                            return Err(schema_err(
                                &name,
                                "selector and action data refs disagree",
                            ));
                        }
                    }
                }
                TableType::Selection => {
                    if t.max_group_size == 0 {
                        return Err(schema_err(&name, "no max group size"));
                    }
                }
                TableType::Action | TableType::ValueLookup => {
                    if sel_ref.is_some()
                        || (t.table_type == TableType::ValueLookup
                            && adt_ref.is_some())
                    {
                        return Err(schema_err(
                            &name,
                            "unexpected table reference",
                        ));
                    }
                }
            }
            if t.table_type == TableType::Action && adt_ref.is_some() {
                return Err(schema_err(&name, "unexpected table reference"));
            }

            let key_fields = convert_key_fields(&name, t.match_key_fields)?;
            let key_format = match t.match_key_format {
                Some(f) => f,
                None => derive_key_format(&key_fields),
            };
            let key_len = check_key_format(&name, &key_fields, &key_format)?;
            let actions = convert_actions(&name, t.actions)?;
            if let Some(hdl) = t.default_action_handle {
                if actions.iter().all(|a| a.handle != hdl) {
                    return Err(schema_err(
                        &name,
                        format!("default action {hdl} is not defined"),
                    ));
                }
            }
            if t.add_on_miss && t.default_action_handle.is_none() {
                return Err(schema_err(
                    &name,
                    "add_on_miss requires a default action",
                ));
            }
            check_params(&name, &t.data_fields)?;

            tables.push(Arc::new(TableContext {
                handle: t.handle,
                target_name: t
                    .target_name
                    .unwrap_or_else(|| get_short(&name).to_string()),
                direction: t.direction,
                table_type: t.table_type,
                size: t.size,
                flags: TableFlags {
                    store_entries: t.store_entries,
                    duplicate_entry_check: t.duplicate_entry_check,
                    add_on_miss: t.add_on_miss,
                    idle_timeout_auto_delete: t.idle_timeout_with_auto_delete,
                },
                has_ternary: key_fields
                    .iter()
                    .any(|f| f.match_type == MatchType::Ternary),
                key_fields,
                key_format,
                key_len,
                actions,
                default_action_handle: t.default_action_handle,
                adt_ref,
                sel_ref,
                max_group_size: t.max_group_size,
                allow_duplicate_members: t.allow_duplicate_members,
                data_len: codec::data_len(&t.data_fields),
                data_fields: t.data_fields,
                name,
            }));
        }

        let mut extern_names = BTreeSet::new();
        let mut externs = raw.externs;
        for e in externs.iter_mut() {
            if !extern_names.insert(e.name.clone()) {
                return Err(schema_err(&e.name, "extern name is duplicated"));
            }
            if e.target_name.is_empty() {
                e.target_name = get_short(&e.name).to_string();
            }
        }

        Ok(PipelineContext {
            program_name: raw.program_name,
            compiler_version,
            schema_version,
            arch_name: raw.arch_name,
            tables,
            externs,
        })
    }

    pub fn table(&self, name: &str) -> Option<&Arc<TableContext>> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_by_hdl(&self, hdl: TableHdl) -> Option<&Arc<TableContext>> {
        self.tables.iter().find(|t| t.handle == hdl)
    }
}
