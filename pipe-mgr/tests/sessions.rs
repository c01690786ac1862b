// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use std::collections::BTreeSet;
use std::thread;

use aal::PipeTarget;
use pretty_assertions::assert_eq;

use pipe_mgr::ActionSpec;
use pipe_mgr::PipeMgrError;

mod harness;
use harness::*;

#[test]
fn test_session_busy() -> anyhow::Result<()> {
    let (mgr, _) = manager(1);
    mgr.read(0, DEV, PROFILE, |_| {
        // A session can't be re-entered while a call is in flight
        assert!(matches!(
            mgr.read(0, DEV, PROFILE, |p| p.table_count(ROUTE)),
            Err(PipeMgrError::SessionBusy(0))
        ));
        let held = mgr.sessions_in_use();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].sess_hdl, 0);

        // but another session can get in
        mgr.read(1, DEV, PROFILE, |p| p.table_count(ROUTE))?;
        Ok(())
    })?;
    assert!(mgr.sessions_in_use().is_empty());

    assert!(matches!(
        mgr.read(4, DEV, PROFILE, |p| p.table_count(ROUTE)),
        Err(PipeMgrError::InvalidSession(4))
    ));
    Ok(())
}

#[test]
fn test_session_released_on_error() -> anyhow::Result<()> {
    let (mgr, _) = manager(1);
    let r = mgr.read(SESS, DEV, PROFILE, |p| {
        p.mat_ent_del(ROUTE, 17)?;
        Ok(())
    });
    assert!(matches!(r, Err(PipeMgrError::NotFound(_))));
    assert!(!mgr.sessions().is_in_use(SESS)?);

    // Failing to find the device still closes the bracket
    assert!(matches!(
        mgr.read(SESS, 9, PROFILE, |p| p.table_count(ROUTE)),
        Err(PipeMgrError::NoSuchDevice(9))
    ));
    assert!(matches!(
        mgr.write(SESS, DEV, 3, |p| p.clear_all()),
        Err(PipeMgrError::NoSuchProfile(_))
    ));
    assert!(!mgr.sessions().is_in_use(SESS)?);
    Ok(())
}

#[test]
fn test_force_epilogue() -> anyhow::Result<()> {
    let (mgr, _) = manager(1);
    // A client that claimed a session and went away
    mgr.sessions().prologue(2)?;
    assert!(matches!(
        mgr.read(2, DEV, PROFILE, |p| p.table_count(ROUTE)),
        Err(PipeMgrError::SessionBusy(2))
    ));
    assert_eq!(mgr.sessions_in_use()[0].sess_hdl, 2);

    mgr.force_epilogue(2)?;
    mgr.read(2, DEV, PROFILE, |p| p.table_count(ROUTE))?;
    Ok(())
}

#[test]
fn test_device_registry() -> anyhow::Result<()> {
    let (mgr, stub) = manager(1);
    assert_eq!(mgr.dev_ids(), vec![DEV]);
    let dev = mgr.dev_get(DEV)?;
    assert_eq!(dev.profiles().len(), 1);
    assert_eq!(dev.profile_by_name("pipe")?.id, PROFILE);
    assert_eq!(
        dev.profile(PROFILE)?.compiler_version,
        semver::Version::new(1, 4, 2)
    );

    mgr.read(SESS, DEV, PROFILE, |p| {
        let all = PipeTarget::All;
        p.mat_ent_add(ROUTE, all, &route("10.0.0.0/8"), &forward(1))?;
        p.vl_ent_add(VLAN, all, &vlan_key(1), &vlan_data(1, 0))?;
        Ok(())
    })?;

    mgr.dev_remove(DEV)?;
    assert!(stub.entries(ROUTE).is_empty());
    assert!(stub.entries(VLAN).is_empty());
    assert!(mgr.dev_ids().is_empty());
    assert!(matches!(
        mgr.dev_remove(DEV),
        Err(PipeMgrError::NoSuchDevice(_))
    ));
    assert!(matches!(
        mgr.read(SESS, DEV, PROFILE, |p| p.table_count(ROUTE)),
        Err(PipeMgrError::NoSuchDevice(_))
    ));
    Ok(())
}

// Several clients, each on its own session, hammering the same tables.
#[test]
fn test_concurrent_clients() -> anyhow::Result<()> {
    const CLIENTS: u32 = 4;
    const PER_CLIENT: u32 = 64;
    let (mgr, stub) = manager(1);

    mgr.read(SESS, DEV, PROFILE, |p| {
        let args = nexthop_args(1, 0x0200_0000_0001);
        p.adt_ent_add(NEXTHOP_DATA, PipeTarget::All, 1, SET_NEXTHOP, &args)?;
        Ok(())
    })?;

    let handles = thread::scope(|s| {
        let workers: Vec<_> = (0..CLIENTS)
            .map(|c| {
                let mgr = &mgr;
                s.spawn(move || -> Result<Vec<u32>, PipeMgrError> {
                    let mut mine = Vec::new();
                    for i in 0..PER_CLIENT {
                        let id = c * PER_CLIENT + i;
                        let net = format!("10.{}.{}.0/24", id / 256, id % 256);
                        mine.push(mgr.read(c, DEV, PROFILE, |p| {
                            p.mat_ent_add(
                                ROUTE,
                                PipeTarget::All,
                                &route(&net),
                                &forward(c as u16),
                            )
                        })?);
                        mgr.read(c, DEV, PROFILE, |p| {
                            p.mat_ent_add(
                                NEXTHOP,
                                PipeTarget::All,
                                &nexthop(id as u16),
                                &ActionSpec::Member(1),
                            )
                        })?;
                    }
                    Ok(mine)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect::<Result<Vec<_>, _>>()
    })?;

    let total = (CLIENTS * PER_CLIENT) as usize;
    let unique: BTreeSet<u32> = handles.iter().flatten().copied().collect();
    assert_eq!(unique.len(), total);

    mgr.read(SESS, DEV, PROFILE, |p| {
        assert_eq!(p.table_count(ROUTE)?, total);
        assert_eq!(p.table_count(NEXTHOP)?, total);
        let mh = p.adt_hdl_by_mbr_id(NEXTHOP_DATA, 1)?;
        assert_eq!(
            p.adt_ent_get(NEXTHOP_DATA, mh)?.ref_count as usize,
            total
        );
        Ok(())
    })?;
    assert_eq!(stub.entries(ROUTE).len(), total);
    Ok(())
}

// Writers clearing a table while readers add to it never leave the table and
// its usage counters out of step.
#[test]
fn test_clear_while_adding() -> anyhow::Result<()> {
    let (mgr, _) = manager(1);
    thread::scope(|s| {
        let mgr = &mgr;
        let adder = s.spawn(move || -> Result<(), PipeMgrError> {
            for i in 0..200u16 {
                mgr.read(0, DEV, PROFILE, |p| {
                    let data = vlan_data(i, 0);
                    p.vl_ent_add(VLAN, PipeTarget::All, &vlan_key(i), &data)
                })?;
            }
            Ok(())
        });
        let clearer = s.spawn(move || -> Result<(), PipeMgrError> {
            for _ in 0..20 {
                mgr.write(1, DEV, PROFILE, |p| p.table_clear(VLAN))?;
                thread::yield_now();
            }
            Ok(())
        });
        adder.join().expect("adder panicked")?;
        clearer.join().expect("clearer panicked")
    })?;

    mgr.read(SESS, DEV, PROFILE, |p| {
        let count = p.table_count(VLAN)?;
        let usage = p.table_usage(VLAN)?;
        assert_eq!(usage.occupancy as usize, count);
        assert_eq!(usage.inserts - usage.deletes, count as u64);
        Ok(())
    })?;
    Ok(())
}
