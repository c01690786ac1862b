// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Packing of action parameters (and value-lookup data fields) into the flat
//! byte blobs stored with each entry and handed to the driver.
//!
//! Each parameter occupies `bit_width` bits starting `start_bit` bits into the
//! blob, most significant bit first.  The blob is exactly long enough to hold
//! the parameter that ends last.

use std::collections::BTreeSet;

use aal::ActionArg;
use aal::ValueTypes;

use crate::context::ActionParam;
use crate::types::PipeMgrError;
use crate::types::PipeMgrResult;

pub(crate) fn bytes_for(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// The number of bytes needed to hold every parameter in the list.
pub fn data_len(params: &[ActionParam]) -> usize {
    params
        .iter()
        .map(|p| bytes_for((p.start_bit + p.bit_width) as usize))
        .max()
        .unwrap_or(0)
}

// Bit `k` of a big-endian byte string, counting from the least significant
// bit.  Bits beyond the end of the string are zero.
fn lsb_bit(value: &[u8], k: usize) -> u8 {
    let idx = k / 8;
    if idx >= value.len() {
        0
    } else {
        (value[value.len() - 1 - idx] >> (k % 8)) & 1
    }
}

/// Write the low `width` bits of the big-endian `value` into `buf`, starting
/// `offset` bits from the start of the buffer.
pub(crate) fn write_bits(
    buf: &mut [u8],
    offset: usize,
    width: usize,
    value: &[u8],
) {
    for j in 0..width {
        let bit = lsb_bit(value, width - 1 - j);
        let pos = offset + j;
        let shift = 7 - (pos % 8);
        buf[pos / 8] = (buf[pos / 8] & !(1 << shift)) | (bit << shift);
    }
}

/// Read `width` bits starting `offset` bits into `buf`, returning them as a
/// big-endian byte string of the minimal length.
pub(crate) fn read_bits(buf: &[u8], offset: usize, width: usize) -> Vec<u8> {
    let mut out = vec![0u8; bytes_for(width)];
    let len = out.len();
    for j in 0..width {
        let pos = offset + j;
        let bit = (buf[pos / 8] >> (7 - (pos % 8))) & 1;
        let k = width - 1 - j;
        out[len - 1 - k / 8] |= bit << (k % 8);
    }
    out
}

/// The canonical form of a value for a field of the given width: fields of
/// up to 64 bits are carried inline, wider fields as a big-endian byte string
/// just long enough to hold the field.
pub fn canonical(bytes: &[u8], width: usize) -> ValueTypes {
    if width <= 64 {
        let v = bytes
            .iter()
            .rev()
            .take(8)
            .enumerate()
            .fold(0u64, |acc, (i, b)| acc | (*b as u64) << (8 * i));
        ValueTypes::U64(v)
    } else {
        let want = bytes_for(width);
        let mut out = vec![0u8; want];
        let n = bytes.len().min(want);
        out[want - n..].copy_from_slice(&bytes[bytes.len() - n..]);
        ValueTypes::Ptr(out)
    }
}

/// Verify that a value fits in a field, returning its big-endian bytes.
pub(crate) fn check_width(
    field: &str,
    value: &ValueTypes,
    width: usize,
) -> PipeMgrResult<Vec<u8>> {
    let bits = value.significant_bits();
    if bits > width {
        Err(PipeMgrError::InvalidWidth {
            field: field.to_string(),
            bits,
            width,
        })
    } else {
        Ok(value.to_be_bytes())
    }
}

/// Pack a set of named values into a blob laid out according to `params`.
/// Every parameter must be supplied exactly once, and no value may be wider
/// than its parameter.
pub fn pack(
    params: &[ActionParam],
    args: &[ActionArg],
) -> PipeMgrResult<Vec<u8>> {
    let mut buf = vec![0u8; data_len(params)];
    let mut seen = BTreeSet::new();

    for arg in args {
        let param = params
            .iter()
            .find(|p| p.name == arg.name)
            .ok_or_else(|| {
                PipeMgrError::SchemaMismatch(format!(
                    "unknown parameter: {}",
                    arg.name
                ))
            })?;
        if !seen.insert(param.position) {
            return Err(PipeMgrError::SchemaMismatch(format!(
                "parameter {} supplied twice",
                arg.name
            )));
        }
        let bytes =
            check_width(&param.name, &arg.value, param.bit_width as usize)?;
        write_bits(
            &mut buf,
            param.start_bit as usize,
            param.bit_width as usize,
            &bytes,
        );
    }

    if let Some(missing) = params.iter().find(|p| !seen.contains(&p.position)) {
        return Err(PipeMgrError::SchemaMismatch(format!(
            "missing parameter: {}",
            missing.name
        )));
    }
    Ok(buf)
}

/// Recover the values packed into a blob, in parameter-position order and in
/// canonical form.  Whatever order and representation the values were packed
/// from, each recovered value compares equal to the one supplied.
pub fn unpack(
    params: &[ActionParam],
    data: &[u8],
) -> PipeMgrResult<Vec<ActionArg>> {
    let want = data_len(params);
    if data.len() != want {
        return Err(PipeMgrError::SchemaMismatch(format!(
            "action data is {} bytes, expected {want}",
            data.len()
        )));
    }

    let mut ordered: Vec<&ActionParam> = params.iter().collect();
    ordered.sort_by_key(|p| p.position);
    Ok(ordered
        .into_iter()
        .map(|p| {
            let width = p.bit_width as usize;
            let bytes = read_bits(data, p.start_bit as usize, width);
            ActionArg {
                name: p.name.clone(),
                value: canonical(&bytes, width),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    fn param(
        name: &str,
        position: u32,
        start_bit: u32,
        bit_width: u32,
    ) -> ActionParam {
        ActionParam {
            name: name.into(),
            position,
            start_bit,
            bit_width,
        }
    }

    fn nexthop() -> Vec<ActionParam> {
        vec![
            param("port", 0, 0, 9),
            param("vlan", 1, 9, 12),
            param("dmac", 2, 21, 48),
            param("flag", 3, 69, 1),
        ]
    }

    #[test]
    fn test_layout() -> anyhow::Result<()> {
        let params = vec![param("a", 0, 0, 4), param("b", 1, 4, 12)];
        let data = pack(
            &params,
            &[ActionArg::new("b", 0xabcu16), ActionArg::new("a", 0x5u8)],
        )?;
        assert_eq!(data, vec![0x5a, 0xbc]);

        // Non-byte-aligned parameters straddle byte boundaries
        let data = pack(
            &nexthop(),
            &[
                ActionArg::new("port", 0x1ffu16),
                ActionArg::new("vlan", 0u16),
                ActionArg::new("dmac", 0u64),
                ActionArg::new("flag", true),
            ],
        )?;
        assert_eq!(data.len(), 9);
        assert_eq!(data[0], 0xff);
        assert_eq!(data[1], 0x80);
        assert_eq!(data[8], 0x04);
        Ok(())
    }

    #[test]
    fn test_validation() {
        let params = nexthop();
        let all = |port: u64| {
            vec![
                ActionArg::new("port", port),
                ActionArg::new("vlan", 1u16),
                ActionArg::new("dmac", 2u64),
                ActionArg::new("flag", false),
            ]
        };

        assert!(matches!(
            pack(&params, &all(0x200)),
            Err(PipeMgrError::InvalidWidth {
                bits: 10,
                width: 9,
                ..
            })
        ));

        let mut extra = all(1);
        extra.push(ActionArg::new("ttl", 1u8));
        assert!(matches!(
            pack(&params, &extra),
            Err(PipeMgrError::SchemaMismatch(_))
        ));

        let mut twice = all(1);
        twice.push(ActionArg::new("port", 2u16));
        assert!(matches!(
            pack(&params, &twice),
            Err(PipeMgrError::SchemaMismatch(_))
        ));

        let mut short = all(1);
        short.pop();
        assert!(matches!(
            pack(&params, &short),
            Err(PipeMgrError::SchemaMismatch(_))
        ));

        assert!(unpack(&params, &[0u8; 3]).is_err());
    }

    #[test]
    fn test_wide_values() -> anyhow::Result<()> {
        let params = vec![param("addr", 0, 0, 128), param("len", 1, 128, 8)];
        let addr: std::net::Ipv6Addr = "fd00::1".parse()?;
        let args =
            vec![ActionArg::new("addr", addr), ActionArg::new("len", 64u8)];
        let data = pack(&params, &args)?;
        assert_eq!(data.len(), 17);
        assert_eq!(unpack(&params, &data)?, args);

        // Short byte strings are widened to the canonical length
        let params = vec![param("blob", 0, 0, 72)];
        let data = pack(&params, &[ActionArg::new("blob", vec![1u8, 2])])?;
        let out = unpack(&params, &data)?;
        assert!(matches!(
            &out[0].value,
            ValueTypes::Ptr(v) if v == &[0u8, 0, 0, 0, 0, 0, 0, 1, 2]
        ));
        Ok(())
    }

    // Values supplied as byte strings for narrow fields, in any order, come
    // back equal to what was supplied, sorted by parameter position.
    #[test]
    fn test_byte_string_args() -> anyhow::Result<()> {
        let params = nexthop();
        let args = vec![
            ActionArg::new("flag", true),
            ActionArg::new("dmac", vec![2u8, 0, 0, 0, 0, 1]),
            ActionArg::new("port", vec![0u8, 0, 0x01, 0x20]),
            ActionArg::new("vlan", 100u16),
        ];
        let data = pack(&params, &args)?;
        let out = unpack(&params, &data)?;

        let names: Vec<&str> = out.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["port", "vlan", "dmac", "flag"]);
        for arg in &args {
            let found = out.iter().find(|a| a.name == arg.name);
            assert_eq!(found, Some(arg));
        }
        assert_eq!(out[0].value, ValueTypes::U64(0x120));
        assert_eq!(out[2].value, ValueTypes::U64(0x0200_0000_0001));

        // Packing the recovered values reproduces the blob
        assert_eq!(pack(&params, &out)?, data);
        Ok(())
    }

    // unpack(pack(v)) == v for arbitrary values that fit their fields
    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let mut rng = rand::thread_rng();
        let params = vec![
            param("a", 0, 0, 1),
            param("b", 1, 1, 7),
            param("c", 2, 8, 33),
            param("d", 3, 41, 64),
            param("e", 4, 105, 100),
        ];

        for _ in 0..200 {
            let args: Vec<ActionArg> = params
                .iter()
                .map(|p| {
                    let width = p.bit_width as usize;
                    let mut bytes = vec![0u8; bytes_for(width)];
                    rng.fill(&mut bytes[..]);
                    let spare = bytes.len() * 8 - width;
                    bytes[0] &= 0xffu8 >> spare;
                    ActionArg {
                        name: p.name.clone(),
                        value: canonical(&bytes, width),
                    }
                })
                .collect();
            let data = pack(&params, &args)?;
            assert_eq!(data.len(), 26);
            assert_eq!(unpack(&params, &data)?, args);
        }
        Ok(())
    }
}
