// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use std::io::stdout;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use colored::Colorize;
use display_error_chain::DisplayErrorChain;
use structopt::*;
use tabwriter::TabWriter;

use pipe_mgr::config::Config;
use pipe_mgr::DevId;
use pipe_mgr::PipeMgr;

mod port;
mod table;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pmadm",
    about = "inspects the devices and programs managed by a pipeline manager",
    version = "0.0.1"
)]
struct GlobalOpts {
    #[structopt(short, long, help = "pipeline manager configuration file")]
    config: PathBuf,

    #[structopt(short, long, help = "log to stdout while loading")]
    verbose: bool,

    #[structopt(subcommand)]
    cmd: Commands,
}

#[derive(Debug, StructOpt)]
enum Commands {
    /// Load the configuration and every program it names, then report what
    /// was built.
    Check,
    /// List the profiles loaded onto each device.
    #[structopt(visible_alias = "profiles")]
    Profile,
    Table(table::Table),
    #[structopt(visible_alias = "ports")]
    Port(port::Port),
}

// Which device and profile a command is aimed at.
#[derive(Debug, Clone, Copy, StructOpt)]
pub struct Selector {
    #[structopt(short, long, default_value = "0")]
    /// Device id
    pub dev: DevId,
    #[structopt(short, long, default_value = "0")]
    /// Profile id within the device
    pub profile: u32,
}

fn load(opts: &GlobalOpts) -> anyhow::Result<PipeMgr> {
    let config = Config::from_file(&opts.config).with_context(|| {
        format!("loading config {}", opts.config.display())
    })?;
    let log = if opts.verbose {
        common::logging::init("pmadm", &config.log_file, config.log_format)?
    } else {
        slog::Logger::root(slog::Discard, slog::o!())
    };
    PipeMgr::from_config(&log, &config).map_err(|e| {
        anyhow::anyhow!("{}", DisplayErrorChain::new(&e))
    })
}

fn check(mgr: &PipeMgr) -> anyhow::Result<()> {
    for dev_id in mgr.dev_ids() {
        let dev = mgr.dev_get(dev_id)?;
        println!(
            "device {dev_id}: {} pipe(s), {} port(s)",
            dev.num_pipes,
            dev.ports().len()
        );
        for p in dev.profiles() {
            let (tables, externs) = p.read(|pipeline| {
                let ctx = pipeline.context();
                Ok((ctx.tables.len(), ctx.externs.len()))
            })?;
            println!(
                "  profile {} ({}/{}): {tables} table(s), {externs} extern(s)",
                p.id, p.prog_name, p.pipeline_name
            );
        }
    }
    println!("{}", "ok".green());
    Ok(())
}

fn profile_list(mgr: &PipeMgr) -> anyhow::Result<()> {
    let mut tw = TabWriter::new(stdout());
    writeln!(
        tw,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        "Dev".underline(),
        "Id".underline(),
        "Program".underline(),
        "Pipeline".underline(),
        "Compiler".underline(),
        "Core".underline(),
        "Created".underline(),
    )?;
    for dev_id in mgr.dev_ids() {
        let dev = mgr.dev_get(dev_id)?;
        let created = dev.created.format("%Y-%m-%d %H:%M:%S");
        for p in dev.profiles() {
            writeln!(
                tw,
                "{dev_id}\t{}\t{}\t{}\t{}\t{}\t{created}",
                p.id,
                p.prog_name,
                p.pipeline_name,
                p.compiler_version,
                p.core_id
            )?;
        }
    }
    tw.flush().map_err(|e| e.into())
}

fn main() -> anyhow::Result<()> {
    let opts = GlobalOpts::from_args();
    let mgr = load(&opts)?;

    match opts.cmd {
        Commands::Check => check(&mgr),
        Commands::Profile => profile_list(&mgr),
        Commands::Table(cmd) => table::table_cmd(&mgr, cmd),
        Commands::Port(cmd) => port::port_cmd(&mgr, cmd),
    }
}
