// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

/// Northbound clients describe table entries in terms of named key fields and
/// named action parameters, with the values expressed as integers, byte
/// strings, or higher-level types such as IP addresses and prefixes.  The
/// pipeline manager validates these against the compiled context of the
/// table, and a driver eventually converts them into whatever on-chip format
/// its target requires.
///
/// This library defines the intermediate representation used for both of
/// those hand-offs, so that neither the clients nor the drivers need to know
/// about each other's native types.
use std::hash::Hash;
use std::hash::Hasher;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use oxnet::{Ipv4Net, Ipv6Net};
use serde::Deserialize;
use serde::Serialize;

use crate::DalError;
use crate::DalResult;

/// The intermediate representation of a single field in a match key
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct MatchEntryField {
    pub name: String,
    pub value: MatchEntryValue,
}

impl MatchEntryField {
    pub fn new(name: impl ToString, value: impl Into<MatchEntryValue>) -> Self {
        MatchEntryField {
            name: name.to_string(),
            value: value.into(),
        }
    }
}

/// The intermediate representation of a match key.  The priority is only
/// meaningful for tables with ternary fields.
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq)]
pub struct MatchSpec {
    pub fields: Vec<MatchEntryField>,
    pub priority: u32,
}

impl MatchSpec {
    pub fn new(fields: Vec<MatchEntryField>) -> Self {
        MatchSpec {
            fields,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn field_by_name<'a>(
        &'a self,
        field: &str,
    ) -> DalResult<&'a MatchEntryField> {
        self.fields
            .iter()
            .find(|f| f.name == field)
            .ok_or(DalError::Internal(format!("no such field: {field}")))
    }
}

/// The intermediate representation of a single argument to an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionArg {
    pub name: String,
    pub value: ValueTypes,
}

impl ActionArg {
    pub fn new(name: impl ToString, value: impl Into<ValueTypes>) -> Self {
        ActionArg {
            name: name.to_string(),
            value: value.into(),
        }
    }
}

/// The different kinds of match key fields
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MatchType {
    Exact,
    Ternary,
    Lpm,
    /// An input to the selector hash rather than a matched field
    Selector,
}

/// The contents of a single field in a match key
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum MatchEntryValue {
    Value(ValueTypes),
    Lpm(MatchLpm),
    Mask(MatchMask),
}

impl From<ValueTypes> for MatchEntryValue {
    fn from(v: ValueTypes) -> Self {
        MatchEntryValue::Value(v)
    }
}

impl From<MatchLpm> for MatchEntryValue {
    fn from(v: MatchLpm) -> Self {
        MatchEntryValue::Lpm(v)
    }
}

impl From<MatchMask> for MatchEntryValue {
    fn from(v: MatchMask) -> Self {
        MatchEntryValue::Mask(v)
    }
}

impl From<Ipv4Net> for MatchEntryValue {
    fn from(v: Ipv4Net) -> Self {
        MatchEntryValue::Lpm(v.into())
    }
}

impl From<Ipv6Net> for MatchEntryValue {
    fn from(v: Ipv6Net) -> Self {
        MatchEntryValue::Lpm(v.into())
    }
}

impl From<Ipv6Net> for MatchLpm {
    fn from(cidr: Ipv6Net) -> Self {
        let v: u128 = cidr.addr().into();
        MatchLpm {
            prefix: v.into(),
            len: cidr.width() as u16,
        }
    }
}

impl From<Ipv4Net> for MatchLpm {
    fn from(cidr: Ipv4Net) -> Self {
        let v: u32 = cidr.addr().into();
        MatchLpm {
            prefix: v.into(),
            len: cidr.width() as u16,
        }
    }
}

impl From<Ipv6Addr> for ValueTypes {
    fn from(v: Ipv6Addr) -> ValueTypes {
        let t: u128 = v.into();
        t.into()
    }
}

impl From<Ipv4Addr> for ValueTypes {
    fn from(v: Ipv4Addr) -> ValueTypes {
        ValueTypes::U64(u32::from(v) as u64)
    }
}

impl From<Vec<u8>> for ValueTypes {
    fn from(v: Vec<u8>) -> ValueTypes {
        ValueTypes::Ptr(v)
    }
}

impl From<&[u8]> for ValueTypes {
    fn from(v: &[u8]) -> ValueTypes {
        ValueTypes::Ptr(v.to_vec())
    }
}

impl From<u128> for ValueTypes {
    fn from(v: u128) -> ValueTypes {
        ValueTypes::Ptr(v.to_be_bytes().to_vec())
    }
}

impl From<u64> for ValueTypes {
    fn from(v: u64) -> ValueTypes {
        ValueTypes::U64(v)
    }
}

impl From<u32> for ValueTypes {
    fn from(v: u32) -> ValueTypes {
        ValueTypes::U64(v as u64)
    }
}

impl From<u8> for ValueTypes {
    fn from(v: u8) -> ValueTypes {
        ValueTypes::U64(v as u64)
    }
}

impl From<u16> for ValueTypes {
    fn from(v: u16) -> ValueTypes {
        ValueTypes::U64(v as u64)
    }
}

impl From<bool> for ValueTypes {
    fn from(v: bool) -> ValueTypes {
        ValueTypes::U64(match v {
            false => 0,
            true => 1,
        })
    }
}

/// A key or parameter value.  Values up to 64 bits wide are carried inline;
/// anything wider is a big-endian byte string.
///
/// Two values are equal when they hold the same number, whichever form each
/// is carried in and however many leading zero bytes a byte string has.
#[derive(Debug, Clone)]
pub enum ValueTypes {
    U64(u64),
    Ptr(Vec<u8>),
}

// The bytes of a big-endian value with its leading zeros removed
fn magnitude(bytes: &[u8]) -> &[u8] {
    let idx = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[idx..]
}

impl PartialEq for ValueTypes {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ValueTypes::U64(a), ValueTypes::U64(b)) => a == b,
            _ => {
                magnitude(&self.to_be_bytes())
                    == magnitude(&other.to_be_bytes())
            }
        }
    }
}

impl Eq for ValueTypes {}

impl Hash for ValueTypes {
    fn hash<H: Hasher>(&self, state: &mut H) {
        magnitude(&self.to_be_bytes()).hash(state);
    }
}

impl ValueTypes {
    /// The big-endian bytes of the value.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        match self {
            ValueTypes::U64(v) => v.to_be_bytes().to_vec(),
            ValueTypes::Ptr(v) => v.clone(),
        }
    }

    /// The number of bits needed to hold the value, i.e. the position of its
    /// most significant set bit.
    pub fn significant_bits(&self) -> usize {
        match self {
            ValueTypes::U64(v) => (64 - v.leading_zeros()) as usize,
            ValueTypes::Ptr(v) => {
                match v.iter().position(|b| *b != 0) {
                    Some(idx) => {
                        (v.len() - idx) * 8 - v[idx].leading_zeros() as usize
                    }
                    None => 0,
                }
            }
        }
    }
}

impl std::fmt::Display for ValueTypes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ValueTypes::U64(v) => write!(f, "0x{v:x}"),
            ValueTypes::Ptr(v) => {
                write!(f, "0x")?;
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// A value and the mask selecting which of its bits participate in a ternary
/// match.
#[derive(Debug, Hash, Clone, PartialEq, Eq)]
pub struct MatchMask {
    pub val: ValueTypes,
    pub mask: ValueTypes,
}

impl std::fmt::Display for MatchMask {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.val, self.mask)
    }
}

#[derive(Debug, Hash, Clone, PartialEq, Eq)]
pub struct MatchLpm {
    pub prefix: ValueTypes,
    pub len: u16,
}

impl std::fmt::Display for MatchLpm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.prefix, self.len)
    }
}
