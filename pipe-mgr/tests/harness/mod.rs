// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

// Not every test binary uses every helper
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use aal::ActionArg;
use aal::DalOps;
use aal::MatchEntryField;
use aal::MatchSpec;
use aal::ValueTypes;
use common::logging::LogFormat;
use dal::stub::StubDal;
use oxnet::Ipv4Net;

use pipe_mgr::context::PipelineContext;
use pipe_mgr::Device;
use pipe_mgr::DeviceFamily;
use pipe_mgr::PipeMgr;
use pipe_mgr::Profile;

pub const DEV: pipe_mgr::DevId = 0;
pub const PROFILE: u32 = 0;
pub const SESS: u32 = 0;

pub const ROUTE: u32 = 1;
pub const NEXTHOP: u32 = 2;
pub const NEXTHOP_DATA: u32 = 3;
pub const NEXTHOP_SEL: u32 = 4;
pub const ACL: u32 = 5;
pub const FLOWS: u32 = 6;
pub const VLAN: u32 = 7;
pub const LEARN: u32 = 8;

pub const FORWARD: u32 = 10;
pub const DROP: u32 = 11;
pub const SET_NEXTHOP: u32 = 20;
pub const DENY: u32 = 30;
pub const COUNT: u32 = 40;
pub const LEARN_PORT: u32 = 50;

pub fn log() -> slog::Logger {
    common::logging::init("test", &None, LogFormat::Human).unwrap()
}

pub fn data_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

pub fn router_context() -> PipelineContext {
    PipelineContext::from_file(&data_path("router.json")).unwrap()
}

/// A manager with a single device running the router program on top of the
/// given driver.
pub fn manager_with(
    driver: Arc<dyn DalOps>,
    num_pipes: u16,
    max_sessions: usize,
) -> PipeMgr {
    let log = log();
    let mut dev =
        Device::new(&log, DEV, DeviceFamily::Dpdk, num_pipes, driver.clone());
    let profile = Profile::new(
        &log,
        PROFILE,
        "pipe",
        router_context(),
        driver,
        num_pipes,
    )
    .unwrap();
    dev.profile_add(profile).unwrap();

    let mgr = PipeMgr::new(&log, max_sessions);
    mgr.dev_add(dev).unwrap();
    mgr
}

/// A manager on the stub driver, along with the driver so tests can see what
/// was programmed.
pub fn manager(num_pipes: u16) -> (PipeMgr, Arc<StubDal>) {
    let stub = Arc::new(StubDal::new(&log()));
    let mgr = manager_with(stub.clone(), num_pipes, 4);
    (mgr, stub)
}

pub fn route(net: &str) -> MatchSpec {
    let net: Ipv4Net = net.parse().unwrap();
    MatchSpec::new(vec![MatchEntryField::new("hdr.ipv4.dst_addr", net)])
}

pub fn forward(port: u16) -> pipe_mgr::ActionSpec {
    pipe_mgr::ActionSpec::Direct {
        act_fn_hdl: FORWARD,
        args: vec![ActionArg::new("port", port)],
    }
}

pub fn nexthop(id: u16) -> MatchSpec {
    let v = ValueTypes::from(id);
    MatchSpec::new(vec![MatchEntryField::new("meta.nexthop_id", v)])
}

pub fn nexthop_args(port: u16, mac: u64) -> Vec<ActionArg> {
    vec![ActionArg::new("port", port), ActionArg::new("dst_mac", mac)]
}

pub fn flow(id: u32) -> MatchSpec {
    let v = ValueTypes::from(id);
    MatchSpec::new(vec![MatchEntryField::new("meta.flow_id", v)])
}

pub fn vlan_key(port: u16) -> MatchSpec {
    let v = ValueTypes::from(port);
    MatchSpec::new(vec![MatchEntryField::new("meta.port", v)])
}

pub fn vlan_data(vid: u16, pcp: u8) -> Vec<ActionArg> {
    vec![ActionArg::new("vid", vid), ActionArg::new("pcp", pcp)]
}
