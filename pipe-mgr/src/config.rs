// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Configuration for the pipeline manager.
//!
//! The configuration is a single TOML file describing the devices to manage.
//! Each device lists the ports feeding it and the programs loaded onto it,
//! and each pipeline of a program becomes one profile:
//!
//! ```toml
//! log_format = "json"
//! max_sessions = 8
//!
//! [[device]]
//! dev_id = 0
//! num_pipes = 2
//! driver = { kind = "stub" }
//!
//! [[device.port]]
//! dev_port = 0
//! port_name = "net0"
//! type = "tap"
//! mtu = 1500
//! mempool_name = "MEMPOOL0"
//! pipe_in = "pipe"
//! pipe_out = "pipe"
//! port_in_id = 0
//! port_out_id = 0
//!
//! [[device.program]]
//! name = "router"
//!
//! [[device.program.pipeline]]
//! name = "pipe"
//! context = "router/context.json"
//! ```
//!
//! Relative paths are resolved against the directory holding the
//! configuration file.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use common::logging::LogFormat;
use common::ports::PortAttributes;
use dal::DriverConfig;
use serde::Deserialize;

use crate::device::DeviceFamily;
use crate::profile::MirrorProfile;
use crate::profile::MAX_CT_TIMER_PROFILES;
use crate::types::*;

fn default_sessions() -> usize {
    common::DEFAULT_MAX_SESSIONS
}

fn default_pipes() -> u16 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// If set, where the log should be written.  If not set, the log goes to
    /// stdout.
    #[serde(default)]
    pub log_file: Option<String>,

    /// Output log info in unstructured text or json?
    #[serde(default)]
    pub log_format: LogFormat,

    /// Size of the client session pool
    #[serde(default = "default_sessions")]
    pub max_sessions: usize,

    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: None,
            log_format: LogFormat::default(),
            max_sessions: default_sessions(),
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub dev_id: DevId,
    #[serde(default)]
    pub family: DeviceFamily,
    #[serde(default)]
    pub driver: DriverConfig,
    /// Number of pipeline replicas each table is instantiated in
    #[serde(default = "default_pipes")]
    pub num_pipes: u16,
    /// Device-wide settings, passed through untouched
    #[serde(default)]
    pub global: toml::Table,
    #[serde(default, rename = "port")]
    pub ports: Vec<PortConfig>,
    #[serde(default, rename = "program")]
    pub programs: Vec<ProgramConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    pub dev_port: u32,
    #[serde(flatten)]
    pub attrs: PortAttributes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramConfig {
    pub name: String,
    #[serde(default, rename = "pipeline")]
    pub pipelines: Vec<PipelineConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    /// The compiled context json
    pub context: PathBuf,
    /// The binary configuration built alongside the context
    #[serde(default)]
    pub config: Option<PathBuf>,
    #[serde(default)]
    pub core_id: u32,
    #[serde(default)]
    pub fast_clone: bool,
    #[serde(default)]
    pub mirror: Vec<MirrorProfile>,
    /// Connection-tracking timeouts, in seconds
    #[serde(default)]
    pub ct_timeouts: Vec<u32>,
}

fn config_err(msg: impl ToString) -> PipeMgrError {
    PipeMgrError::Config(msg.to_string())
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> PipeMgrResult<Self> {
        let txt = std::fs::read_to_string(path).map_err(|e| {
            config_err(format!("reading {}: {e}", path.display()))
        })?;
        let mut config = Config::parse(&txt)?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }

    /// Parse and validate a configuration.  Paths are left as written.
    pub fn parse(txt: &str) -> PipeMgrResult<Self> {
        let config: Config = toml::from_str(txt)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        };
        for d in &mut self.devices {
            for p in d.programs.iter_mut().flat_map(|p| &mut p.pipelines) {
                resolve(&mut p.context);
                if let Some(c) = p.config.as_mut() {
                    resolve(c);
                }
            }
        }
    }

    fn validate(&self) -> PipeMgrResult<()> {
        if self.max_sessions == 0 {
            return Err(config_err("max_sessions must be at least 1"));
        }
        let mut dev_ids = BTreeSet::new();
        for d in &self.devices {
            if !dev_ids.insert(d.dev_id) {
                return Err(config_err(format!(
                    "device {} defined twice",
                    d.dev_id
                )));
            }
            d.validate()?;
        }
        Ok(())
    }
}

impl DeviceConfig {
    fn validate(&self) -> PipeMgrResult<()> {
        let dev = self.dev_id;
        if self.num_pipes == 0 {
            return Err(config_err(format!(
                "device {dev}: num_pipes must be at least 1"
            )));
        }

        let mut ports = BTreeSet::new();
        for p in &self.ports {
            if !ports.insert(p.dev_port) {
                return Err(config_err(format!(
                    "device {dev}: port {} defined twice",
                    p.dev_port
                )));
            }
            p.attrs.validate().map_err(|e| {
                config_err(format!("device {dev}: port {}: {e}", p.dev_port))
            })?;
        }

        let mut names = BTreeSet::new();
        for prog in &self.programs {
            for p in &prog.pipelines {
                if !names.insert((&prog.name, &p.name)) {
                    return Err(config_err(format!(
                        "device {dev}: pipeline {}/{} defined twice",
                        prog.name, p.name
                    )));
                }
                p.validate()
                    .map_err(|e| config_err(format!("device {dev}: {e}")))?;
            }
        }
        Ok(())
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<(), String> {
        if self.ct_timeouts.len() > MAX_CT_TIMER_PROFILES {
            return Err(format!(
                "pipeline {}: {} ct_timeouts, at most {} allowed",
                self.name,
                self.ct_timeouts.len(),
                MAX_CT_TIMER_PROFILES
            ));
        }
        let mut sessions = BTreeSet::new();
        for m in &self.mirror {
            if !sessions.insert(m.session_id) {
                return Err(format!(
                    "pipeline {}: mirror session {} defined twice",
                    self.name, m.session_id
                ));
            }
        }
        Ok(())
    }
}
