// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

//! The attribute model for the software ports feeding a DPDK pipeline.
//!
//! Ports are owned by the port manager, not by the pipeline manager.  The
//! pipeline manager only consumes the pipe-in and pipe-out identifiers, but the
//! full model lives here so that the configuration and admin tooling can
//! describe ports using the same field identifiers the port manager exposes.

use std::convert::TryFrom;
use std::fmt;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;
use thiserror::Error;

// Buffer sizes used by the port manager.  Each includes the terminating NUL,
// so the longest accepted string is one byte shorter.
pub const PORT_NAME_LEN: usize = 64;
pub const PIPE_NAME_LEN: usize = 64;
pub const MEMPOOL_NAME_LEN: usize = 64;
pub const PCIE_BDF_LEN: usize = 16;
pub const PCAP_FILE_NAME_LEN: usize = 128;
pub const DEV_ARGS_LEN: usize = 256;

pub const PORT_MTU_MAX: u32 = 65535;
pub const PORT_MTU_DEFAULT: u32 = 1500;
pub const RING_SIZE_DEFAULT: u32 = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Unknown port field id: {0}")]
    UnknownField(u32),
    #[error("Field {field} does not apply to {kind} ports")]
    WrongKind { field: PortDataField, kind: PortType },
    #[error("Field {field} expects a {expected} value")]
    WrongType {
        field: PortDataField,
        expected: &'static str,
    },
    #[error("Field {field} is {len} bytes long, limit is {max}")]
    TooLong {
        field: PortDataField,
        len: usize,
        max: usize,
    },
    #[error("Invalid port attribute: {0}")]
    Invalid(String),
}

pub type PortResult<T> = Result<T, PortError>;

/// The kinds of port the DPDK target can instantiate.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
    EnumIter,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PortType {
    Tap,
    Link,
    Source,
    Sink,
    Ring,
}

/// Which directions a port carries traffic in.
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
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PortDir {
    /// Both rx and tx
    #[default]
    Default,
    TxOnly,
    RxOnly,
}

/// The attributes specific to each kind of port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PortKind {
    Tap {
        mtu: u32,
    },
    Link {
        pcie_bdf: String,
        #[serde(default)]
        dev_args: String,
        #[serde(default)]
        hotplug: bool,
    },
    Source {
        file_name: String,
    },
    Sink {
        file_name: String,
    },
    Ring {
        size: u32,
    },
}

impl PortKind {
    /// A kind-specific attribute set with every field at its default.
    pub fn default_for(port_type: PortType) -> Self {
        match port_type {
            PortType::Tap => PortKind::Tap {
                mtu: PORT_MTU_DEFAULT,
            },
            PortType::Link => PortKind::Link {
                pcie_bdf: String::new(),
                dev_args: String::new(),
                hotplug: false,
            },
            PortType::Source => PortKind::Source {
                file_name: String::new(),
            },
            PortType::Sink => PortKind::Sink {
                file_name: String::new(),
            },
            PortType::Ring => PortKind::Ring {
                size: RING_SIZE_DEFAULT,
            },
        }
    }

    pub fn port_type(&self) -> PortType {
        match self {
            PortKind::Tap { .. } => PortType::Tap,
            PortKind::Link { .. } => PortType::Link,
            PortKind::Source { .. } => PortType::Source,
            PortKind::Sink { .. } => PortType::Sink,
            PortKind::Ring { .. } => PortType::Ring,
        }
    }
}

/// Key field identifiers of the port manager table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortKeyField {
    DevPort = 0,
}

/// Data field identifiers of the port manager table.  The numeric values are
/// the field ids used by northbound clients.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, strum::Display,
)]
#[repr(u32)]
#[strum(serialize_all = "snake_case")]
pub enum PortDataField {
    PortName = 0,
    PortType,
    PortDir,
    Mtu,
    PipeIn,
    PipeOut,
    PortInId,
    PortOutId,
    Mempool,
    PcieBdf,
    FileName,
    DevArgs,
    DevHotplugEnabled,
    Size,
    NetPort,
}

impl TryFrom<u32> for PortDataField {
    type Error = PortError;

    fn try_from(id: u32) -> PortResult<Self> {
        use strum::IntoEnumIterator;
        PortDataField::iter()
            .find(|f| *f as u32 == id)
            .ok_or(PortError::UnknownField(id))
    }
}

/// The value of a single port manager data field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    U32(u32),
    Bool(bool),
    Str(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::U32(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Str(v) => write!(f, "{v}"),
        }
    }
}

/// The key of the port manager table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortKey {
    pub dev_port: u32,
}

/// Everything the port manager knows about a single port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PortAttributes {
    pub port_name: String,
    pub mempool_name: String,
    pub pipe_in: String,
    pub pipe_out: String,
    #[serde(default)]
    pub direction: PortDir,
    pub port_in_id: u32,
    pub port_out_id: u32,
    /// Network port if set, host port otherwise
    #[serde(default)]
    pub net_port: bool,
    #[serde(flatten)]
    pub kind: PortKind,
}

fn want_str(field: PortDataField, value: FieldValue) -> PortResult<String> {
    match value {
        FieldValue::Str(s) => Ok(s),
        _ => Err(PortError::WrongType {
            field,
            expected: "string",
        }),
    }
}

fn want_u32(field: PortDataField, value: FieldValue) -> PortResult<u32> {
    match value {
        FieldValue::U32(v) => Ok(v),
        _ => Err(PortError::WrongType {
            field,
            expected: "u32",
        }),
    }
}

fn want_bool(field: PortDataField, value: FieldValue) -> PortResult<bool> {
    match value {
        FieldValue::Bool(v) => Ok(v),
        // The port manager carries flags as integers on the wire
        FieldValue::U32(v) => Ok(v != 0),
        _ => Err(PortError::WrongType {
            field,
            expected: "bool",
        }),
    }
}

fn check_len(field: PortDataField, s: &str, buf_len: usize) -> PortResult<()> {
    if s.len() >= buf_len {
        Err(PortError::TooLong {
            field,
            len: s.len(),
            max: buf_len - 1,
        })
    } else {
        Ok(())
    }
}

impl PortAttributes {
    /// Create a port of the given type, with every other attribute empty.
    pub fn new(port_name: impl ToString, port_type: PortType) -> Self {
        PortAttributes {
            port_name: port_name.to_string(),
            mempool_name: String::new(),
            pipe_in: String::new(),
            pipe_out: String::new(),
            direction: PortDir::Default,
            port_in_id: 0,
            port_out_id: 0,
            net_port: false,
            kind: PortKind::default_for(port_type),
        }
    }

    /// Assemble a port from a list of field-id/value pairs.  The list must
    /// include the port type.
    pub fn from_fields(fields: &[(u32, FieldValue)]) -> PortResult<Self> {
        let port_type = fields
            .iter()
            .find(|(id, _)| *id == PortDataField::PortType as u32)
            .ok_or(PortError::Invalid("port type is required".into()))
            .and_then(|(_, v)| {
                let name = want_str(PortDataField::PortType, v.clone())?;
                name.parse::<PortType>().map_err(|_| {
                    PortError::Invalid(format!("unknown port type: {name}"))
                })
            })?;

        let mut attrs = PortAttributes::new("", port_type);
        for (id, value) in fields {
            attrs.set_field_by_id(*id, value.clone())?;
        }
        attrs.validate()?;
        Ok(attrs)
    }

    pub fn port_type(&self) -> PortType {
        self.kind.port_type()
    }

    fn wrong_kind(&self, field: PortDataField) -> PortError {
        PortError::WrongKind {
            field,
            kind: self.port_type(),
        }
    }

    pub fn get_field_by_id(&self, id: u32) -> PortResult<FieldValue> {
        self.get_field(PortDataField::try_from(id)?)
    }

    pub fn set_field_by_id(
        &mut self,
        id: u32,
        value: FieldValue,
    ) -> PortResult<()> {
        self.set_field(PortDataField::try_from(id)?, value)
    }

    /// Fetch a single data field.  Kind-specific fields are only readable on
    /// ports of that kind.
    pub fn get_field(&self, field: PortDataField) -> PortResult<FieldValue> {
        use FieldValue::*;

        Ok(match (field, &self.kind) {
            (PortDataField::PortName, _) => Str(self.port_name.clone()),
            (PortDataField::PortType, k) => Str(k.port_type().to_string()),
            (PortDataField::PortDir, _) => Str(self.direction.to_string()),
            (PortDataField::PipeIn, _) => Str(self.pipe_in.clone()),
            (PortDataField::PipeOut, _) => Str(self.pipe_out.clone()),
            (PortDataField::PortInId, _) => U32(self.port_in_id),
            (PortDataField::PortOutId, _) => U32(self.port_out_id),
            (PortDataField::Mempool, _) => Str(self.mempool_name.clone()),
            (PortDataField::NetPort, _) => Bool(self.net_port),
            (PortDataField::Mtu, PortKind::Tap { mtu }) => U32(*mtu),
            (PortDataField::PcieBdf, PortKind::Link { pcie_bdf, .. }) => {
                Str(pcie_bdf.clone())
            }
            (PortDataField::DevArgs, PortKind::Link { dev_args, .. }) => {
                Str(dev_args.clone())
            }
            (
                PortDataField::DevHotplugEnabled,
                PortKind::Link { hotplug, .. },
            ) => Bool(*hotplug),
            (PortDataField::FileName, PortKind::Source { file_name })
            | (PortDataField::FileName, PortKind::Sink { file_name }) => {
                Str(file_name.clone())
            }
            (PortDataField::Size, PortKind::Ring { size }) => U32(*size),
            (field, _) => return Err(self.wrong_kind(field)),
        })
    }

    /// Update a single data field.  Changing the port type resets the
    /// kind-specific attributes to their defaults.
    pub fn set_field(
        &mut self,
        field: PortDataField,
        value: FieldValue,
    ) -> PortResult<()> {
        match field {
            PortDataField::PortName => {
                let v = want_str(field, value)?;
                check_len(field, &v, PORT_NAME_LEN)?;
                self.port_name = v;
            }
            PortDataField::PortType => {
                let v = want_str(field, value)?;
                let t = v.parse::<PortType>().map_err(|_| {
                    PortError::Invalid(format!("unknown port type: {v}"))
                })?;
                if t != self.port_type() {
                    self.kind = PortKind::default_for(t);
                }
            }
            PortDataField::PortDir => {
                let v = want_str(field, value)?;
                self.direction = v.parse::<PortDir>().map_err(|_| {
                    PortError::Invalid(format!("unknown port direction: {v}"))
                })?;
            }
            PortDataField::PipeIn => {
                let v = want_str(field, value)?;
                check_len(field, &v, PIPE_NAME_LEN)?;
                self.pipe_in = v;
            }
            PortDataField::PipeOut => {
                let v = want_str(field, value)?;
                check_len(field, &v, PIPE_NAME_LEN)?;
                self.pipe_out = v;
            }
            PortDataField::PortInId => {
                self.port_in_id = want_u32(field, value)?;
            }
            PortDataField::PortOutId => {
                self.port_out_id = want_u32(field, value)?;
            }
            PortDataField::Mempool => {
                let v = want_str(field, value)?;
                check_len(field, &v, MEMPOOL_NAME_LEN)?;
                self.mempool_name = v;
            }
            PortDataField::NetPort => {
                self.net_port = want_bool(field, value)?;
            }
            PortDataField::Mtu => {
                let v = want_u32(field, value)?;
                match &mut self.kind {
                    PortKind::Tap { mtu } => *mtu = v,
                    _ => return Err(self.wrong_kind(field)),
                }
            }
            PortDataField::PcieBdf => {
                let v = want_str(field, value)?;
                check_len(field, &v, PCIE_BDF_LEN)?;
                match &mut self.kind {
                    PortKind::Link { pcie_bdf, .. } => *pcie_bdf = v,
                    _ => return Err(self.wrong_kind(field)),
                }
            }
            PortDataField::DevArgs => {
                let v = want_str(field, value)?;
                check_len(field, &v, DEV_ARGS_LEN)?;
                match &mut self.kind {
                    PortKind::Link { dev_args, .. } => *dev_args = v,
                    _ => return Err(self.wrong_kind(field)),
                }
            }
            PortDataField::DevHotplugEnabled => {
                let v = want_bool(field, value)?;
                match &mut self.kind {
                    PortKind::Link { hotplug, .. } => *hotplug = v,
                    _ => return Err(self.wrong_kind(field)),
                }
            }
            PortDataField::FileName => {
                let v = want_str(field, value)?;
                check_len(field, &v, PCAP_FILE_NAME_LEN)?;
                match &mut self.kind {
                    PortKind::Source { file_name }
                    | PortKind::Sink { file_name } => *file_name = v,
                    _ => return Err(self.wrong_kind(field)),
                }
            }
            PortDataField::Size => {
                let v = want_u32(field, value)?;
                match &mut self.kind {
                    PortKind::Ring { size } => *size = v,
                    _ => return Err(self.wrong_kind(field)),
                }
            }
        }
        Ok(())
    }

    /// Check the limits the port manager enforces on a complete port
    /// definition.
    pub fn validate(&self) -> PortResult<()> {
        if self.port_name.is_empty() {
            return Err(PortError::Invalid("port name is required".into()));
        }
        check_len(PortDataField::PortName, &self.port_name, PORT_NAME_LEN)?;
        check_len(PortDataField::PipeIn, &self.pipe_in, PIPE_NAME_LEN)?;
        check_len(PortDataField::PipeOut, &self.pipe_out, PIPE_NAME_LEN)?;
        check_len(
            PortDataField::Mempool,
            &self.mempool_name,
            MEMPOOL_NAME_LEN,
        )?;

        match &self.kind {
            PortKind::Tap { mtu } if *mtu == 0 || *mtu > PORT_MTU_MAX => {
                Err(PortError::Invalid(format!("mtu {mtu} out of range")))
            }
            PortKind::Link { pcie_bdf, dev_args, .. } => {
                check_len(PortDataField::PcieBdf, pcie_bdf, PCIE_BDF_LEN)?;
                check_len(PortDataField::DevArgs, dev_args, DEV_ARGS_LEN)
            }
            PortKind::Source { file_name } | PortKind::Sink { file_name } => {
                if file_name.is_empty() {
                    Err(PortError::Invalid("pcap file name is required".into()))
                } else {
                    check_len(
                        PortDataField::FileName,
                        file_name,
                        PCAP_FILE_NAME_LEN,
                    )
                }
            }
            PortKind::Ring { size } if *size == 0 => {
                Err(PortError::Invalid("ring size must be non-zero".into()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tap() -> PortAttributes {
        let mut p = PortAttributes::new("TAP0", PortType::Tap);
        p.mempool_name = "MEMPOOL0".into();
        p.pipe_in = "pipe".into();
        p.pipe_out = "pipe".into();
        p.port_in_id = 0;
        p.port_out_id = 1;
        p
    }

    #[test]
    fn test_field_ids() {
        assert_eq!(PortDataField::PortName as u32, 0);
        assert_eq!(PortDataField::Mtu as u32, 3);
        assert_eq!(PortDataField::NetPort as u32, 14);
        assert_eq!(PortDataField::try_from(13).unwrap(), PortDataField::Size);
        assert_eq!(
            PortDataField::try_from(15).unwrap_err(),
            PortError::UnknownField(15)
        );
    }

    #[test]
    fn test_kind_specific_fields() {
        let mut p = tap();
        assert_eq!(
            p.get_field(PortDataField::Mtu).unwrap(),
            FieldValue::U32(PORT_MTU_DEFAULT)
        );
        p.set_field(PortDataField::Mtu, FieldValue::U32(9000)).unwrap();
        assert_eq!(p.kind, PortKind::Tap { mtu: 9000 });

        // A tap port has no pcap file
        assert!(matches!(
            p.get_field(PortDataField::FileName),
            Err(PortError::WrongKind { .. })
        ));
        assert!(matches!(
            p.set_field(PortDataField::Size, FieldValue::U32(10)),
            Err(PortError::WrongKind { .. })
        ));

        // Switching to a ring resets the kind-specific attributes
        p.set_field(PortDataField::PortType, FieldValue::Str("ring".into()))
            .unwrap();
        assert_eq!(
            p.get_field(PortDataField::Size).unwrap(),
            FieldValue::U32(RING_SIZE_DEFAULT)
        );
        assert_eq!(p.port_in_id, 0);
        assert_eq!(p.port_out_id, 1);
    }

    #[test]
    fn test_from_fields() {
        let fields = vec![
            (PortDataField::PortName as u32, FieldValue::Str("LINK0".into())),
            (PortDataField::PortType as u32, FieldValue::Str("link".into())),
            (PortDataField::PortDir as u32, FieldValue::Str("rx_only".into())),
            (
                PortDataField::PcieBdf as u32,
                FieldValue::Str("0000:00:04.0".into()),
            ),
            (PortDataField::DevHotplugEnabled as u32, FieldValue::U32(1)),
            (PortDataField::PortInId as u32, FieldValue::U32(4)),
            (PortDataField::PortOutId as u32, FieldValue::U32(5)),
        ];
        let p = PortAttributes::from_fields(&fields).unwrap();
        assert_eq!(p.direction, PortDir::RxOnly);
        assert_eq!(
            p.kind,
            PortKind::Link {
                pcie_bdf: "0000:00:04.0".into(),
                dev_args: String::new(),
                hotplug: true,
            }
        );
        assert_eq!(p.get_field_by_id(7).unwrap(), FieldValue::U32(5));

        // No port type
        assert!(PortAttributes::from_fields(&fields[..1]).is_err());
    }

    #[test]
    fn test_limits() {
        let mut p = tap();
        let long = "x".repeat(PORT_NAME_LEN);
        assert!(matches!(
            p.set_field(PortDataField::PortName, FieldValue::Str(long)),
            Err(PortError::TooLong { max: 63, .. })
        ));
        assert!(matches!(
            p.set_field(PortDataField::Mtu, FieldValue::Str("big".into())),
            Err(PortError::WrongType { .. })
        ));

        p.set_field(PortDataField::Mtu, FieldValue::U32(PORT_MTU_MAX + 1))
            .unwrap();
        assert!(p.validate().is_err());

        let sink = PortAttributes::new("SINK0", PortType::Sink);
        assert!(sink.validate().is_err());
    }

    #[test]
    fn test_deserialize() {
        let p: PortAttributes = serde_json::from_str(
            r#"{
                "port_name": "RING0",
                "mempool_name": "MEMPOOL0",
                "pipe_in": "pipe",
                "pipe_out": "pipe",
                "port_in_id": 2,
                "port_out_id": 3,
                "type": "ring",
                "size": 256
            }"#,
        )
        .unwrap();
        assert_eq!(p.kind, PortKind::Ring { size: 256 });
        assert_eq!(p.direction, PortDir::Default);
        assert!(!p.net_port);
        p.validate().unwrap();
    }
}
