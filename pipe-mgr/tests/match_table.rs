// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use std::collections::BTreeSet;

use aal::ActionArg;
use aal::DalEntry;
use aal::MatchEntryField;
use aal::MatchMask;
use aal::MatchSpec;
use aal::PipeTarget;
use aal::ValueTypes;
use pretty_assertions::assert_eq;
use rand::Rng;

use pipe_mgr::ActionSpec;
use pipe_mgr::PipeMgrError;
use pipe_mgr::INVALID_HDL;

mod harness;
use harness::*;

fn acl(val: u32, mask: u32, priority: u32) -> MatchSpec {
    let m = MatchMask {
        val: ValueTypes::from(val),
        mask: ValueTypes::from(mask),
    };
    MatchSpec::new(vec![MatchEntryField::new("hdr.ipv4.src_addr", m)])
        .with_priority(priority)
}

#[test]
fn test_duplicate_route() -> anyhow::Result<()> {
    let (mgr, _) = manager(1);
    let all = PipeTarget::All;

    mgr.read(SESS, DEV, PROFILE, |p| {
        let h1 = p.mat_ent_add(ROUTE, all, &route("10.0.0.0/24"), &forward(1))?;
        assert!(matches!(
            p.mat_ent_add(ROUTE, all, &route("10.0.0.0/24"), &forward(2)),
            Err(PipeMgrError::DuplicateEntry(_))
        ));
        // Host bits beyond the prefix don't make a different key
        assert!(matches!(
            p.mat_ent_add(ROUTE, all, &route("10.0.0.9/24"), &forward(2)),
            Err(PipeMgrError::DuplicateEntry(_))
        ));
        assert_eq!(
            p.mat_lookup_by_spec(ROUTE, all, &route("10.0.0.0/24"))?,
            Some(h1)
        );

        p.mat_ent_del(ROUTE, h1)?;
        assert_eq!(
            p.mat_lookup_by_spec(ROUTE, all, &route("10.0.0.0/24"))?,
            None
        );
        let h2 = p.mat_ent_add(ROUTE, all, &route("10.0.0.0/24"), &forward(3))?;
        assert_eq!(
            p.mat_lookup_by_spec(ROUTE, all, &route("10.0.0.0/24"))?,
            Some(h2)
        );
        assert_eq!(p.table_count(ROUTE)?, 1);

        let usage = p.table_usage(ROUTE)?;
        assert_eq!(usage.occupancy, 1);
        assert_eq!(usage.inserts, 2);
        assert_eq!(usage.deletes, 1);
        assert_eq!(usage.collisions, 2);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_duplicates_allowed() -> anyhow::Result<()> {
    let (mgr, stub) = manager(1);
    let all = PipeTarget::All;
    let deny = ActionSpec::Direct {
        act_fn_hdl: DENY,
        args: Vec::new(),
    };

    mgr.read(SESS, DEV, PROFILE, |p| {
        let spec = acl(0x0a00_0000, 0xff00_0000, 1);
        let a = p.mat_ent_add(ACL, all, &spec, &deny)?;
        let b = p.mat_ent_add(ACL, all, &spec, &deny)?;
        assert_ne!(a, b);
        assert_eq!(p.table_count(ACL)?, 2);

        // The priority is part of a ternary key
        let high = acl(0x0a00_0000, 0xff00_0000, 2);
        let c = p.mat_ent_add(ACL, all, &high, &deny)?;
        assert_eq!(p.mat_lookup_by_spec(ACL, all, &high)?, Some(c));

        // The oldest of the duplicates answers a lookup, and the other takes
        // over once it is gone.
        assert_eq!(p.mat_lookup_by_spec(ACL, all, &spec)?, Some(a));
        p.mat_ent_del_by_spec(ACL, all, &spec)?;
        assert_eq!(p.mat_lookup_by_spec(ACL, all, &spec)?, Some(b));
        Ok(())
    })?;
    assert_eq!(stub.entries(ACL).len(), 2);
    Ok(())
}

#[test]
fn test_entry_get_modify() -> anyhow::Result<()> {
    let (mgr, stub) = manager(1);
    let all = PipeTarget::All;
    let spec = route("192.168.1.0/24");

    mgr.read(SESS, DEV, PROFILE, |p| {
        let h = p.mat_ent_add(ROUTE, all, &spec, &forward(7))?;
        let info = p.mat_ent_get(ROUTE, h)?;
        assert_eq!(info.hdl, h);
        assert_eq!(info.target, all);
        assert_eq!(info.match_spec, spec);
        assert_eq!(info.action, forward(7));

        p.mat_ent_modify(ROUTE, h, &forward(9))?;
        assert_eq!(p.mat_ent_get(ROUTE, h)?.action, forward(9));

        // drop is only a default action
        let drop = ActionSpec::Direct {
            act_fn_hdl: DROP,
            args: Vec::new(),
        };
        assert!(matches!(
            p.mat_ent_modify(ROUTE, h, &drop),
            Err(PipeMgrError::SchemaMismatch(_))
        ));
        assert!(matches!(
            p.mat_ent_modify(ROUTE, h, &forward(512)),
            Err(PipeMgrError::InvalidWidth { .. })
        ));
        assert!(matches!(
            p.mat_ent_modify(ROUTE, h + 1, &forward(1)),
            Err(PipeMgrError::NotFound(_))
        ));
        assert!(matches!(
            p.mat_ent_add(ROUTE, all, &nexthop(1), &forward(1)),
            Err(PipeMgrError::SchemaMismatch(_))
        ));

        let usage = p.table_usage(ROUTE)?;
        assert_eq!(usage.updates, 1);
        assert_eq!(usage.update_misses, 1);
        Ok(())
    })?;

    // The driver holds the modified entry
    let entries = stub.entries(ROUTE);
    assert_eq!(entries.len(), 1);
    let DalEntry::Match { key, .. } = &entries[0].1 else {
        panic!("unexpected entry {:?}", entries[0]);
    };
    assert_eq!(key, &spec);
    Ok(())
}

#[test]
fn test_iteration() -> anyhow::Result<()> {
    let (mgr, _) = manager(1);
    mgr.read(SESS, DEV, PROFILE, |p| {
        assert_eq!(p.table_get_first(ROUTE)?, None);
        let mut hdls = Vec::new();
        for i in 0..5u8 {
            let net = format!("10.{i}.0.0/16");
            hdls.push(p.mat_ent_add(
                ROUTE,
                PipeTarget::All,
                &route(&net),
                &forward(i.into()),
            )?);
        }
        p.mat_ent_del(ROUTE, hdls[2])?;

        let first = p.table_get_first(ROUTE)?;
        assert_eq!(first, Some(hdls[0]));
        assert_eq!(
            p.table_get_next_n(ROUTE, hdls[0], 10)?,
            vec![hdls[1], hdls[3], hdls[4]]
        );
        assert_eq!(p.table_get_next_n(ROUTE, hdls[1], 1)?, vec![hdls[3]]);
        assert!(p.table_get_next_n(ROUTE, hdls[4], 3)?.is_empty());
        assert!(matches!(
            p.table_get_next_n(ROUTE, hdls[2], 3),
            Err(PipeMgrError::NotFound(_))
        ));
        assert!(matches!(
            p.table_count(99),
            Err(PipeMgrError::NoSuchTable(_))
        ));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_add_on_miss() -> anyhow::Result<()> {
    let (mgr, _) = manager(1);
    let all = PipeTarget::All;
    let mac = |m: u64| {
        MatchSpec::new(vec![MatchEntryField::new(
            "hdr.ethernet.src_mac",
            ValueTypes::from(m),
        )])
    };
    let port = |p: u16| vec![ActionArg::new("port", p)];

    mgr.read(SESS, DEV, PROFILE, |p| {
        let h =
            p.mat_add_on_miss(LEARN, all, &mac(0xa8_40_25_00_00_01), &port(1))?;
        let info = p.mat_ent_get(LEARN, h)?;
        assert_eq!(
            info.action,
            ActionSpec::Direct {
                act_fn_hdl: LEARN_PORT,
                args: port(1),
            }
        );

        // A miss is an ordinary add, so the usual checks apply
        assert!(matches!(
            p.mat_add_on_miss(LEARN, all, &mac(0xa8_40_25_00_00_01), &port(2)),
            Err(PipeMgrError::DuplicateEntry(_))
        ));
        p.mat_add_on_miss(LEARN, all, &mac(0xa8_40_25_00_00_02), &port(2))?;
        assert!(matches!(
            p.mat_add_on_miss(LEARN, all, &mac(0xa8_40_25_00_00_03), &port(3)),
            Err(PipeMgrError::TableFull(_))
        ));
        assert_eq!(p.table_usage(LEARN)?.exhaustion, 1);

        // The learned action can't be installed as a hit action, and the
        // route table doesn't learn.
        let learn = ActionSpec::Direct {
            act_fn_hdl: LEARN_PORT,
            args: port(4),
        };
        assert!(matches!(
            p.mat_ent_add(LEARN, all, &mac(4), &learn),
            Err(PipeMgrError::SchemaMismatch(_))
        ));
        assert!(matches!(
            p.mat_add_on_miss(ROUTE, all, &route("10.0.0.0/8"), &[]),
            Err(PipeMgrError::Invalid(_))
        ));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_not_stored() -> anyhow::Result<()> {
    let (mgr, stub) = manager(1);
    let all = PipeTarget::All;
    let count = ActionSpec::Direct {
        act_fn_hdl: COUNT,
        args: Vec::new(),
    };

    mgr.read(SESS, DEV, PROFILE, |p| {
        assert_eq!(p.mat_ent_add(FLOWS, all, &flow(1), &count)?, INVALID_HDL);
        assert_eq!(p.mat_ent_add(FLOWS, all, &flow(2), &count)?, INVALID_HDL);
        // Nothing is kept to check a duplicate against
        assert_eq!(p.mat_ent_add(FLOWS, all, &flow(2), &count)?, INVALID_HDL);

        assert!(matches!(
            p.mat_ent_del(FLOWS, 0),
            Err(PipeMgrError::NotStored(_))
        ));
        assert!(matches!(
            p.mat_ent_get(FLOWS, 0),
            Err(PipeMgrError::NotStored(_))
        ));
        assert!(matches!(
            p.mat_ent_modify(FLOWS, 0, &count),
            Err(PipeMgrError::NotStored(_))
        ));
        assert!(matches!(
            p.table_count(FLOWS),
            Err(PipeMgrError::NotStored(_))
        ));

        p.mat_ent_del_by_spec(FLOWS, all, &flow(1))?;
        assert_eq!(p.table_usage(FLOWS)?.inserts, 3);
        assert_eq!(p.table_usage(FLOWS)?.deletes, 1);
        Ok(())
    })?;
    // Both copies of flow 2 are still programmed
    assert_eq!(stub.entries(FLOWS).len(), 2);
    Ok(())
}

#[test]
fn test_replicas() -> anyhow::Result<()> {
    let (mgr, _) = manager(2);
    let spec = route("172.16.0.0/12");
    let (p0, p1) = (PipeTarget::Pipe(0), PipeTarget::Pipe(1));

    mgr.read(SESS, DEV, PROFILE, |p| {
        let h0 = p.mat_ent_add(ROUTE, p0, &spec, &forward(1))?;
        let h1 = p.mat_ent_add(ROUTE, p1, &spec, &forward(2))?;
        assert_ne!(h0, h1);

        // An entry for every pipe collides with each per-pipe entry
        assert!(matches!(
            p.mat_ent_add(ROUTE, PipeTarget::All, &spec, &forward(3)),
            Err(PipeMgrError::DuplicateEntry(_))
        ));
        assert!(matches!(
            p.mat_ent_add(ROUTE, PipeTarget::Pipe(2), &spec, &forward(3)),
            Err(PipeMgrError::Invalid(_))
        ));

        p.mat_ent_del_by_spec(ROUTE, p0, &spec)?;
        assert_eq!(p.mat_lookup_by_spec(ROUTE, p0, &spec)?, None);
        assert_eq!(p.mat_lookup_by_spec(ROUTE, p1, &spec)?, Some(h1));
        assert_eq!(
            p.mat_lookup_by_spec(ROUTE, PipeTarget::All, &spec)?,
            Some(h1)
        );

        p.mat_ent_del(ROUTE, h1)?;
        let all = p.mat_ent_add(ROUTE, PipeTarget::All, &spec, &forward(4))?;
        assert_eq!(p.mat_lookup_by_spec(ROUTE, p0, &spec)?, Some(all));
        assert_eq!(p.mat_lookup_by_spec(ROUTE, p1, &spec)?, Some(all));
        assert!(matches!(
            p.mat_ent_add(ROUTE, p1, &spec, &forward(5)),
            Err(PipeMgrError::DuplicateEntry(_))
        ));
        Ok(())
    })?;
    Ok(())
}

// Random adds and deletes, checking after every step that the table tracks
// exactly the handles it has handed out.
#[test]
fn test_handle_accounting() -> anyhow::Result<()> {
    let (mgr, stub) = manager(1);
    let mut rng = rand::thread_rng();
    let mut live: Vec<(u32, String)> = Vec::new();

    mgr.read(SESS, DEV, PROFILE, |p| {
        for _ in 0..500 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let net = format!("10.{}.0.0/16", rng.gen_range(0..64u8));
                let exists = live.iter().any(|(_, n)| *n == net);
                match p.mat_ent_add(
                    ROUTE,
                    PipeTarget::All,
                    &route(&net),
                    &forward(1),
                ) {
                    Ok(h) => {
                        assert!(!exists);
                        live.push((h, net));
                    }
                    Err(PipeMgrError::DuplicateEntry(_)) => assert!(exists),
                    Err(e) => return Err(e),
                }
            } else {
                let (h, net) = live.swap_remove(rng.gen_range(0..live.len()));
                if rng.gen_bool(0.5) {
                    p.mat_ent_del(ROUTE, h)?;
                } else {
                    let spec = route(&net);
                    p.mat_ent_del_by_spec(ROUTE, PipeTarget::All, &spec)?;
                }
            }

            let handles: BTreeSet<u32> = live.iter().map(|(h, _)| *h).collect();
            assert_eq!(handles.len(), live.len());
            assert_eq!(p.table_count(ROUTE)?, live.len());
            assert_eq!(p.table_usage(ROUTE)?.occupancy as usize, live.len());
            for (h, net) in &live {
                assert_eq!(
                    p.mat_lookup_by_spec(ROUTE, PipeTarget::All, &route(net))?,
                    Some(*h)
                );
            }
        }
        Ok(())
    })?;
    assert_eq!(stub.entries(ROUTE).len(), live.len());
    Ok(())
}

#[test]
fn test_value_lookup() -> anyhow::Result<()> {
    let (mgr, stub) = manager(1);
    let all = PipeTarget::All;

    mgr.read(SESS, DEV, PROFILE, |p| {
        let h = p.vl_ent_add(VLAN, all, &vlan_key(3), &vlan_data(100, 5))?;
        assert!(matches!(
            p.vl_ent_add(VLAN, all, &vlan_key(3), &vlan_data(200, 1)),
            Err(PipeMgrError::DuplicateEntry(_))
        ));
        assert!(matches!(
            p.vl_ent_add(VLAN, all, &vlan_key(4), &vlan_data(4096, 1)),
            Err(PipeMgrError::InvalidWidth { .. })
        ));
        assert_eq!(p.vl_lookup_by_spec(VLAN, all, &vlan_key(3))?, Some(h));

        let info = p.vl_ent_get(VLAN, h)?;
        assert_eq!(info.match_spec, vlan_key(3));
        assert_eq!(info.data, vlan_data(100, 5));

        p.vl_ent_modify(VLAN, h, &vlan_data(101, 6))?;
        assert_eq!(p.vl_ent_get(VLAN, h)?.data, vlan_data(101, 6));

        // Data comes back in field order, whatever form it was given in
        let given = vec![
            ActionArg::new("pcp", 2u8),
            ActionArg::new("vid", vec![0u8, 0, 0x0c, 0x80]),
        ];
        p.vl_ent_modify(VLAN, h, &given)?;
        assert_eq!(p.vl_ent_get(VLAN, h)?.data, vlan_data(0xc80, 2));

        p.vl_ent_add(VLAN, all, &vlan_key(4), &vlan_data(7, 0))?;
        p.vl_ent_del_by_spec(VLAN, all, &vlan_key(3))?;
        assert!(matches!(
            p.vl_ent_get(VLAN, h),
            Err(PipeMgrError::NotFound(_))
        ));
        assert!(matches!(
            p.vl_ent_del_by_spec(VLAN, all, &vlan_key(3)),
            Err(PipeMgrError::NotFound(_))
        ));
        assert_eq!(p.table_count(VLAN)?, 1);
        Ok(())
    })?;
    assert_eq!(stub.entries(VLAN).len(), 1);
    Ok(())
}

#[test]
fn test_clear() -> anyhow::Result<()> {
    let (mgr, stub) = manager(1);
    mgr.read(SESS, DEV, PROFILE, |p| {
        for i in 0..4u8 {
            let net = format!("10.{i}.0.0/16");
            p.mat_ent_add(ROUTE, PipeTarget::All, &route(&net), &forward(1))?;
        }
        let all = PipeTarget::All;
        p.vl_ent_add(VLAN, all, &vlan_key(1), &vlan_data(1, 0))?;
        Ok(())
    })?;

    mgr.write(SESS, DEV, PROFILE, |p| p.table_clear(ROUTE))?;
    mgr.read(SESS, DEV, PROFILE, |p| {
        assert_eq!(p.table_count(ROUTE)?, 0);
        assert_eq!(p.table_usage(ROUTE)?.deletes, 4);
        assert_eq!(p.table_count(VLAN)?, 1);

        // Handles start over once a table is cleared
        let h = p.mat_ent_add(
            ROUTE,
            PipeTarget::All,
            &route("10.0.0.0/16"),
            &forward(1),
        )?;
        assert_eq!(h, 0);
        Ok(())
    })?;
    assert_eq!(stub.entries(ROUTE).len(), 1);

    mgr.write(SESS, DEV, PROFILE, |p| p.clear_all())?;
    assert!(stub.entries(ROUTE).is_empty());
    assert!(stub.entries(VLAN).is_empty());
    Ok(())
}

#[test]
fn test_counters() -> anyhow::Result<()> {
    let (mgr, stub) = manager(1);
    stub.counter_bump("pipe.ingress.route_hits", 3, 2, 128);
    mgr.read(SESS, DEV, PROFILE, |p| {
        let c = p.counter_read("route_hits", 3)?;
        assert_eq!(c.pkts, Some(2));
        assert_eq!(c.bytes, Some(128));
        p.counter_clear("pipe.ingress.route_hits", 3)?;
        assert_eq!(p.counter_read("route_hits", 3)?.pkts, Some(0));
        assert!(matches!(
            p.counter_read("route_hits", 1024),
            Err(PipeMgrError::Invalid(_))
        ));
        Ok(())
    })?;
    Ok(())
}
