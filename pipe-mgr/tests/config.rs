// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use aal::PipeTarget;
use common::ports::PortDir;
use common::ports::PortType;
use pretty_assertions::assert_eq;

use pipe_mgr::config::Config;
use pipe_mgr::PipeMgr;
use pipe_mgr::PipeMgrError;

mod harness;
use harness::*;

#[test]
fn test_from_config() -> anyhow::Result<()> {
    let config = Config::from_file(&data_path("pipe-mgr.toml"))?;
    assert_eq!(config.max_sessions, 2);
    let pipelines = &config.devices[0].programs[0].pipelines;
    assert_eq!(pipelines[0].context, data_path("router.json"));

    let mgr = PipeMgr::from_config(&log(), &config)?;
    assert_eq!(mgr.sessions().size(), 2);

    let dev = mgr.dev_get(0)?;
    assert_eq!(dev.num_pipes, 2);
    assert_eq!(dev.profiles().len(), 2);
    assert_eq!(dev.port_pipe_ids(1)?, (1, 1));
    let src = dev.port_get(1)?;
    assert_eq!(src.port_type(), PortType::Source);
    assert_eq!(src.direction, PortDir::RxOnly);

    let profile = dev.profile_by_name("pipe")?;
    assert_eq!(profile.prog_name, "router");
    assert_eq!(profile.core_id, 2);
    assert_eq!(profile.ct_timeouts, vec![30, 120]);
    assert_eq!(profile.mirror_profile(4).map(|m| m.truncate_length), Some(128));
    assert!(profile.mirror_profile(5).is_none());

    // Each profile has tables of its own
    let alt = dev.profile_by_name("pipe_alt")?.id;
    let p1 = PipeTarget::Pipe(1);
    let spec = route("10.0.0.0/8");
    mgr.read(0, 0, profile.id, |p| {
        p.mat_ent_add(ROUTE, p1, &spec, &forward(1))
    })?;
    mgr.read(0, 0, alt, |p| p.mat_ent_add(ROUTE, p1, &spec, &forward(1)))?;
    assert!(matches!(
        mgr.read(1, 0, alt, |p| {
            p.mat_ent_add(ROUTE, PipeTarget::Pipe(2), &spec, &forward(1))
        }),
        Err(PipeMgrError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn test_missing_context() {
    let config = Config::parse(
        r#"
        [[device]]
        dev_id = 3
        [[device.program]]
        name = "router"
        [[device.program.pipeline]]
        name = "pipe"
        context = "/nonexistent/context.json"
        "#,
    )
    .unwrap();
    assert!(PipeMgr::from_config(&log(), &config).is_err());
}

#[test]
fn test_bad_chaos() {
    let config = Config::parse(
        r#"
        [[device]]
        dev_id = 3
        driver = { kind = "chaos", entry_add = { default = 1.5 } }
        "#,
    )
    .unwrap();
    assert!(matches!(
        PipeMgr::from_config(&log(), &config),
        Err(PipeMgrError::Driver(_))
    ));
}
