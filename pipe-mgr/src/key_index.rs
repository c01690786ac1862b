// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! Canonical match keys and the per-replica index built on them.
//!
//! A canonical key is the table's key buffer filled with the masked field
//! values, followed by a second buffer holding the masks themselves.  Two
//! match specs produce the same canonical key exactly when they match the
//! same packets at the same priority, regardless of how the caller spelled
//! them (a /24 prefix with host bits set, an exact value supplied as a full
//! length prefix, etc.).  Overlap between different keys is not detected.

use std::collections::BTreeSet;
use std::collections::HashMap;

use aal::MatchEntryValue;
use aal::MatchSpec;
use aal::MatchType;

use crate::codec;
use crate::context::ByteOrder;
use crate::context::KeyField;
use crate::context::TableContext;
use crate::types::*;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchKey(Vec<u8>);

// All ones in the low `width` bits of an `n`-byte big-endian string
fn ones(width: usize) -> Vec<u8> {
    let n = codec::bytes_for(width);
    let mut v = vec![0xffu8; n];
    if n > 0 {
        v[0] &= 0xffu8 >> (n * 8 - width);
    }
    v
}

fn prefix_mask(width: usize, len: usize) -> Vec<u8> {
    let n = codec::bytes_for(width);
    let mut v = vec![0u8; n];
    for k in (width - len)..width {
        v[n - 1 - k / 8] |= 1 << (k % 8);
    }
    v
}

// Resize a big-endian byte string that is known to fit in `n` bytes.
fn fit(bytes: Vec<u8>, n: usize) -> Vec<u8> {
    if bytes.len() >= n {
        bytes[bytes.len() - n..].to_vec()
    } else {
        let mut out = vec![0u8; n - bytes.len()];
        out.extend(bytes);
        out
    }
}

// Extract the value and mask for one field, both as big-endian byte strings
// exactly as wide as the field.
fn value_and_mask(
    field: &KeyField,
    value: &MatchEntryValue,
) -> PipeMgrResult<(Vec<u8>, Vec<u8>)> {
    let width = field.bit_width as usize;
    let n = codec::bytes_for(width);
    let name = &field.name;
    let mismatch = || {
        PipeMgrError::SchemaMismatch(format!(
            "{name} is a {} field, got {value:?}",
            field.match_type
        ))
    };

    let (v, m) = match (field.match_type, value) {
        (MatchType::Exact, MatchEntryValue::Value(v))
        | (MatchType::Ternary, MatchEntryValue::Value(v))
        | (MatchType::Lpm, MatchEntryValue::Value(v)) => {
            (codec::check_width(name, v, width)?, ones(width))
        }
        (MatchType::Lpm, MatchEntryValue::Lpm(lpm)) => {
            let len = lpm.len as usize;
            if len > width {
                return Err(PipeMgrError::InvalidWidth {
                    field: name.clone(),
                    bits: len,
                    width,
                });
            }
            (
                codec::check_width(name, &lpm.prefix, width)?,
                prefix_mask(width, len),
            )
        }
        (MatchType::Ternary, MatchEntryValue::Mask(m)) => (
            codec::check_width(name, &m.val, width)?,
            codec::check_width(name, &m.mask, width)?,
        ),
        _ => return Err(mismatch()),
    };
    let m = fit(m, n);
    let v = fit(v, n).iter().zip(m.iter()).map(|(v, m)| v & m).collect();
    Ok((v, m))
}

impl MatchKey {
    /// Build the canonical key for a match spec.  Every match field of the
    /// table must be present exactly once.  Selector fields may be supplied,
    /// but do not contribute to the key.
    pub fn build(ctx: &TableContext, spec: &MatchSpec) -> PipeMgrResult<Self> {
        let mut value = vec![0u8; ctx.key_len];
        let mut mask = vec![0u8; ctx.key_len];
        let mut seen = BTreeSet::new();

        for f in &spec.fields {
            let field = ctx.key_field(&f.name).ok_or_else(|| {
                PipeMgrError::SchemaMismatch(format!(
                    "{} is not a key field of {}",
                    f.name, ctx.name
                ))
            })?;
            if !seen.insert(field.position) {
                return Err(PipeMgrError::SchemaMismatch(format!(
                    "key field {} supplied twice",
                    f.name
                )));
            }
            if field.match_type == MatchType::Selector {
                continue;
            }

            let fmt = ctx.key_format(&field.name).ok_or_else(|| {
                PipeMgrError::Schema(format!("no key format for {}", f.name))
            })?;
            let (mut v, mut m) = value_and_mask(field, &f.value)?;
            if fmt.byte_order == ByteOrder::Host {
                v.reverse();
                m.reverse();
            }
            let width = field.bit_width as usize;
            codec::write_bits(&mut value, fmt.bit_offset(), width, &v);
            codec::write_bits(&mut mask, fmt.bit_offset(), width, &m);
        }

        let mut absent =
            ctx.match_fields().filter(|f| !seen.contains(&f.position));
        if let Some(f) = absent.next() {
            return Err(PipeMgrError::SchemaMismatch(format!(
                "missing key field: {}",
                f.name
            )));
        }

        value.extend(mask);
        if ctx.has_ternary {
            value.extend(spec.priority.to_be_bytes());
        }
        Ok(MatchKey(value))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// The index of live entries in one replica of a table, keyed by canonical
/// match key.
#[derive(Debug, Default)]
pub struct KeyIndex {
    dup_check: bool,
    map: HashMap<MatchKey, Vec<EntryHdl>>,
}

impl KeyIndex {
    pub fn new(dup_check: bool) -> Self {
        KeyIndex {
            dup_check,
            map: HashMap::new(),
        }
    }

    /// Would inserting this key be rejected as a duplicate?
    pub fn collides(&self, key: &MatchKey) -> bool {
        self.dup_check && self.map.contains_key(key)
    }

    pub fn insert(
        &mut self,
        key: MatchKey,
        hdl: EntryHdl,
    ) -> PipeMgrResult<()> {
        if let Some(existing) = self.map.get(&key).and_then(|h| h.first()) {
            if self.dup_check {
                return Err(PipeMgrError::DuplicateEntry(format!(
                    "key matches entry {existing}"
                )));
            }
        }
        self.map.entry(key).or_default().push(hdl);
        Ok(())
    }

    /// The oldest live entry with this key
    pub fn lookup(&self, key: &MatchKey) -> Option<EntryHdl> {
        self.map.get(key).and_then(|h| h.first().copied())
    }

    /// Drop a single entry from the index, returning whether it was present.
    pub fn remove(&mut self, key: &MatchKey, hdl: EntryHdl) -> bool {
        let Some(hdls) = self.map.get_mut(key) else {
            return false;
        };
        let Some(idx) = hdls.iter().position(|h| *h == hdl) else {
            return false;
        };
        hdls.remove(idx);
        if hdls.is_empty() {
            self.map.remove(key);
        }
        true
    }

    /// Number of entries in the index
    pub fn len(&self) -> usize {
        self.map.values().map(|h| h.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
