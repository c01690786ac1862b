// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use std::io::stdout;
use std::io::Write;

use colored::Colorize;
use structopt::*;
use tabwriter::TabWriter;

use common::ports::PortAttributes;
use common::ports::PortKind;
use pipe_mgr::DevId;
use pipe_mgr::PipeMgr;

#[derive(Debug, StructOpt)]
/// Examine the ports feeding each device.
pub enum Port {
    #[structopt(alias = "ls")]
    /// List the ports of one device, or of every device.
    List {
        #[structopt(short, long)]
        /// Only list the ports of this device
        dev: Option<DevId>,
    },
    /// Display every attribute of a single port.
    Get {
        #[structopt(short, long, default_value = "0")]
        dev: DevId,
        dev_port: u32,
    },
}

// The attribute specific to each kind of port
fn detail(kind: &PortKind) -> String {
    match kind {
        PortKind::Tap { mtu } => format!("mtu={mtu}"),
        PortKind::Link { pcie_bdf, .. } => format!("bdf={pcie_bdf}"),
        PortKind::Source { file_name } | PortKind::Sink { file_name } => {
            format!("file={file_name}")
        }
        PortKind::Ring { size } => format!("size={size}"),
    }
}

fn port_list(mgr: &PipeMgr, dev: Option<DevId>) -> anyhow::Result<()> {
    let devs = match dev {
        Some(d) => vec![d],
        None => mgr.dev_ids(),
    };

    let mut tw = TabWriter::new(stdout());
    writeln!(
        tw,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        "Dev".underline(),
        "Port".underline(),
        "Name".underline(),
        "Type".underline(),
        "Dir".underline(),
        "Pipes".underline(),
        "Detail".underline(),
    )?;
    for dev_id in devs {
        for (dev_port, attrs) in mgr.dev_get(dev_id)?.ports() {
            writeln!(
                tw,
                "{dev_id}\t{dev_port}\t{}\t{}\t{}\t{}/{}\t{}",
                attrs.port_name,
                attrs.kind.port_type(),
                attrs.direction,
                attrs.pipe_in,
                attrs.pipe_out,
                detail(&attrs.kind)
            )?;
        }
    }
    tw.flush().map_err(|e| e.into())
}

fn port_get(mgr: &PipeMgr, dev: DevId, dev_port: u32) -> anyhow::Result<()> {
    let attrs: PortAttributes = mgr.dev_get(dev)?.port_get(dev_port)?;
    let mut tw = TabWriter::new(stdout());
    writeln!(tw, "name:\t{}", attrs.port_name)?;
    writeln!(tw, "type:\t{}", attrs.kind.port_type())?;
    writeln!(tw, "direction:\t{}", attrs.direction)?;
    writeln!(tw, "mempool:\t{}", attrs.mempool_name)?;
    writeln!(tw, "pipe in:\t{} ({})", attrs.pipe_in, attrs.port_in_id)?;
    writeln!(tw, "pipe out:\t{} ({})", attrs.pipe_out, attrs.port_out_id)?;
    writeln!(tw, "network:\t{}", attrs.net_port)?;
    writeln!(tw, "detail:\t{}", detail(&attrs.kind))?;
    tw.flush().map_err(|e| e.into())
}

pub fn port_cmd(mgr: &PipeMgr, port_cmd: Port) -> anyhow::Result<()> {
    match port_cmd {
        Port::List { dev } => port_list(mgr, dev),
        Port::Get { dev, dev_port } => port_get(mgr, dev, dev_port),
    }
}
