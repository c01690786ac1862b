// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::{debug, error, info, o};

use aal::DalOps;
use common::ports::PortAttributes;

use crate::config::DeviceConfig;
use crate::context::PipelineContext;
use crate::profile::Profile;
use crate::types::*;

/// The kinds of device the pipeline manager can drive
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceFamily {
    #[default]
    Dpdk,
}

/// A device and every profile loaded onto it
pub struct Device {
    pub dev_id: DevId,
    pub family: DeviceFamily,
    pub num_pipes: u16,
    /// Device-wide settings, passed through untouched
    pub global: toml::Table,
    pub created: DateTime<Utc>,
    log: slog::Logger,
    driver: Arc<dyn DalOps>,
    profiles: Vec<Arc<Profile>>,
    // Ports feeding the device, keyed by dev_port
    ports: RwLock<BTreeMap<u32, PortAttributes>>,
}

impl Device {
    pub fn new(
        log: &slog::Logger,
        dev_id: DevId,
        family: DeviceFamily,
        num_pipes: u16,
        driver: Arc<dyn DalOps>,
    ) -> Self {
        let log = log.new(o!("unit" => "device", "dev_id" => dev_id));
        Device {
            dev_id,
            family,
            num_pipes,
            global: toml::Table::new(),
            created: Utc::now(),
            log,
            driver,
            profiles: Vec::new(),
            ports: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build a device, its ports, and its profiles from its configuration.
    /// Every pipeline's context file is loaded and validated.
    pub fn from_config(
        log: &slog::Logger,
        cfg: &DeviceConfig,
    ) -> PipeMgrResult<Self> {
        let driver = dal::new_driver(log, &cfg.driver)?;
        let mut dev =
            Device::new(log, cfg.dev_id, cfg.family, cfg.num_pipes, driver);
        dev.global = cfg.global.clone();

        for p in &cfg.ports {
            dev.port_add(p.dev_port, p.attrs.clone())?;
        }

        for prog in &cfg.programs {
            for p in &prog.pipelines {
                debug!(dev.log, "loading context";
                    "program" => &prog.name,
                    "pipeline" => &p.name,
                    "path" => p.context.display().to_string());
                let ctx = PipelineContext::from_file(&p.context)?;
                let mut profile = Profile::new(
                    &dev.log,
                    dev.profiles.len() as u32,
                    &p.name,
                    ctx,
                    dev.driver.clone(),
                    dev.num_pipes,
                )?;
                profile.prog_name = prog.name.clone();
                profile.core_id = p.core_id;
                profile.fast_clone = p.fast_clone;
                profile.cfg_file = p.config.clone();
                profile.mirror_profiles = p.mirror.clone();
                profile.set_ct_timeouts(p.ct_timeouts.clone())?;
                dev.profile_add(profile)?;
            }
        }
        Ok(dev)
    }

    pub fn driver(&self) -> &Arc<dyn DalOps> {
        &self.driver
    }

    /// Attach a profile to the device.  Program and pipeline name pairs
    /// must be unique.
    pub fn profile_add(&mut self, profile: Profile) -> PipeMgrResult<()> {
        if self.profiles.iter().any(|p| {
            p.id == profile.id
                || (p.prog_name == profile.prog_name
                    && p.pipeline_name == profile.pipeline_name)
        }) {
            return Err(PipeMgrError::Exists(format!(
                "profile {} ({}/{})",
                profile.id, profile.prog_name, profile.pipeline_name
            )));
        }
        info!(self.log, "added profile {}", profile.id;
            "program" => &profile.prog_name,
            "pipeline" => &profile.pipeline_name);
        self.profiles.push(Arc::new(profile));
        Ok(())
    }

    pub fn profile(&self, id: u32) -> PipeMgrResult<&Arc<Profile>> {
        self.profiles
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| PipeMgrError::NoSuchProfile(format!("{id}")))
    }

    /// Find a profile by its pipeline name
    pub fn profile_by_name(
        &self,
        pipeline_name: &str,
    ) -> PipeMgrResult<&Arc<Profile>> {
        self.profiles
            .iter()
            .find(|p| p.pipeline_name == pipeline_name)
            .ok_or_else(|| {
                PipeMgrError::NoSuchProfile(pipeline_name.to_string())
            })
    }

    pub fn profiles(&self) -> &[Arc<Profile>] {
        &self.profiles
    }

    pub fn port_add(
        &self,
        dev_port: u32,
        attrs: PortAttributes,
    ) -> PipeMgrResult<()> {
        attrs.validate()?;
        let mut ports = self.ports.write();
        if ports.contains_key(&dev_port) {
            return Err(PipeMgrError::Exists(format!("port {dev_port}")));
        }
        debug!(self.log, "added port {dev_port}";
            "name" => &attrs.port_name,
            "type" => %attrs.port_type());
        ports.insert(dev_port, attrs);
        Ok(())
    }

    pub fn port_del(&self, dev_port: u32) -> PipeMgrResult<()> {
        if self.ports.write().remove(&dev_port).is_none() {
            return Err(PipeMgrError::NotFound(format!("port {dev_port}")));
        }
        debug!(self.log, "removed port {dev_port}");
        Ok(())
    }

    pub fn port_get(&self, dev_port: u32) -> PipeMgrResult<PortAttributes> {
        self.ports
            .read()
            .get(&dev_port)
            .cloned()
            .ok_or_else(|| PipeMgrError::NotFound(format!("port {dev_port}")))
    }

    /// The pipe-in and pipe-out ids a port is bound to
    pub fn port_pipe_ids(&self, dev_port: u32) -> PipeMgrResult<(u32, u32)> {
        let p = self.port_get(dev_port)?;
        Ok((p.port_in_id, p.port_out_id))
    }

    pub fn ports(&self) -> Vec<(u32, PortAttributes)> {
        self.ports
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Clear every table of every profile.  Each profile is cleared under its
    /// write lock.  All profiles are attempted, and the first failure is
    /// returned.
    pub fn teardown(&self) -> PipeMgrResult<()> {
        let mut result = Ok(());
        for p in &self.profiles {
            if let Err(e) = p.write(|pipeline| pipeline.clear_all()) {
                error!(self.log, "failed to clear profile {}: {e}", p.id);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        info!(self.log, "torn down");
        result
    }
}
