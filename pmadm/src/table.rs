// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use std::io::stdout;
use std::io::Write;
use std::sync::Arc;

use colored::Colorize;
use structopt::*;
use tabwriter::TabWriter;

use pipe_mgr::context::TableContext;
use pipe_mgr::PipeMgr;

use crate::Selector;

#[derive(Debug, StructOpt)]
/// Examine the tables exposed by a loaded program.
#[structopt(verbatim_doc_comment)]
pub enum Table {
    #[structopt(alias = "ls")]
    /// List the tables of a profile.
    List {
        #[structopt(flatten)]
        sel: Selector,
        #[structopt(short = "P")]
        /// Display the data in a parseable format rather then user-friendly.
        parseable: bool,
    },
    /// Display the match keys and actions of a table.
    Schema {
        #[structopt(flatten)]
        sel: Selector,
        /// The name of the table to display.
        name: String,
    },
    /// Display the occupancy and operation counts of a table.
    Usage {
        #[structopt(flatten)]
        sel: Selector,
        /// The name of the table to display.
        name: String,
    },
}

fn tables(
    mgr: &PipeMgr,
    sel: Selector,
) -> anyhow::Result<Vec<Arc<TableContext>>> {
    let profile = mgr.profile(sel.dev, sel.profile)?;
    let tables = profile.read(|p| Ok(p.context().tables.clone()))?;
    Ok(tables)
}

fn flags(t: &TableContext) -> String {
    let mut flags = Vec::new();
    if !t.flags.store_entries {
        flags.push("unstored");
    }
    if !t.flags.duplicate_entry_check {
        flags.push("dups");
    }
    if t.flags.add_on_miss {
        flags.push("add-on-miss");
    }
    if t.flags.idle_timeout_auto_delete {
        flags.push("idle-delete");
    }
    if flags.is_empty() {
        "-".to_string()
    } else {
        flags.join(",")
    }
}

fn table_list(
    mgr: &PipeMgr,
    sel: Selector,
    parseable: bool,
) -> anyhow::Result<()> {
    let tables = tables(mgr, sel)?;
    if parseable {
        for t in &tables {
            println!(
                "{},{},{},{},{}",
                t.handle,
                t.name,
                t.table_type,
                t.size,
                flags(t)
            );
        }
        return Ok(());
    }

    let mut tw = TabWriter::new(stdout());
    writeln!(
        tw,
        "{}\t{}\t{}\t{}\t{}",
        "Hdl".underline(),
        "Name".underline(),
        "Type".underline(),
        "Size".underline(),
        "Flags".underline(),
    )?;
    for t in &tables {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}",
            t.handle,
            t.name,
            t.table_type,
            t.size,
            flags(t)
        )?;
    }
    tw.flush().map_err(|e| e.into())
}

fn table_schema(
    mgr: &PipeMgr,
    sel: Selector,
    name: String,
) -> anyhow::Result<()> {
    let t = tables(mgr, sel)?
        .into_iter()
        .find(|t| t.name == name || t.target_name == name)
        .ok_or_else(|| anyhow::anyhow!("no such table: {name}"))?;

    let mut tw = TabWriter::new(stdout());
    writeln!(
        tw,
        "{}\t{}\t{}",
        "Key".underline(),
        "Match".underline(),
        "Width".underline()
    )?;
    for k in t.match_fields() {
        writeln!(tw, "{}\t{}\t{}", k.name, k.match_type, k.bit_width)?;
    }
    for f in &t.data_fields {
        writeln!(tw, "{}\tdata\t{}", f.name, f.bit_width)?;
    }
    writeln!(tw)?;

    writeln!(
        tw,
        "{}\t{}\t{}",
        "Action".underline(),
        "Hdl".underline(),
        "Args".underline()
    )?;
    for a in &t.actions {
        let args: Vec<String> = a
            .params
            .iter()
            .map(|p| format!("{}/{}", p.name, p.bit_width))
            .collect();
        let mut name = a.name.clone();
        if t.default_action_handle == Some(a.handle) {
            name.push_str(" (default)");
        }
        if !a.flags.allowed_as_hit {
            name.push_str(" (default only)");
        }
        writeln!(tw, "{name}\t{}\t{}", a.handle, args.join(" "))?;
    }
    if let Some(adt) = t.adt_ref {
        writeln!(tw, "\naction data table: {adt}")?;
    }
    if let Some(sel) = t.sel_ref {
        writeln!(
            tw,
            "selector table: {sel} (max group size {})",
            t.max_group_size
        )?;
    }
    tw.flush().map_err(|e| e.into())
}

fn table_usage(
    mgr: &PipeMgr,
    sel: Selector,
    name: String,
) -> anyhow::Result<()> {
    let profile = mgr.profile(sel.dev, sel.profile)?;
    let usage = profile.read(|p| p.table_usage(p.table_hdl(&name)?))?;

    let mut tw = TabWriter::new(stdout());
    writeln!(tw, "size:\t{}", usage.size)?;
    writeln!(tw, "occupancy:\t{}", usage.occupancy)?;
    writeln!(tw, "inserts:\t{}", usage.inserts)?;
    writeln!(tw, "deletes:\t{}", usage.deletes)?;
    writeln!(tw, "updates:\t{}", usage.updates)?;
    writeln!(tw, "collisions:\t{}", usage.collisions)?;
    writeln!(tw, "update misses:\t{}", usage.update_misses)?;
    writeln!(tw, "delete misses:\t{}", usage.delete_misses)?;
    writeln!(tw, "exhaustion:\t{}", usage.exhaustion)?;
    tw.flush().map_err(|e| e.into())
}

pub fn table_cmd(mgr: &PipeMgr, table_cmd: Table) -> anyhow::Result<()> {
    match table_cmd {
        Table::List { sel, parseable } => table_list(mgr, sel, parseable),
        Table::Schema { sel, name } => table_schema(mgr, sel, name),
        Table::Usage { sel, name } => table_usage(mgr, sel, name),
    }
}
