// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! NCI packet parsers and serializers.
//!
//! Wire layouts are generated from `nci_packets.pdl` into the [`nci`]
//! module. The types here are the engine's view of them: only the messages
//! consumed or produced by the engine are given a typed representation;
//! everything else travels as a raw [`Message`].

use crate::error::{NciError, Result};
use bytes::Bytes;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use pdl_runtime::Packet;
use std::fmt;

/// NCI packet parser and serializer.
pub mod nci {
    #![allow(clippy::all)]
    #![allow(unused)]
    #![allow(missing_docs)]

    include!(concat!(env!("OUT_DIR"), "/nci_packets.rs"));
}

/// Size of the common NCI packet header.
pub const HEADER_SIZE: usize = 3;
/// Largest payload a single NCI packet can carry.
pub const MAX_PAYLOAD_SIZE: usize = 255;

/// NCI 1.0 version byte.
pub const NCI_VERSION_1_0: u8 = 0x10;
/// NCI 2.0 version byte.
pub const NCI_VERSION_2_0: u8 = 0x20;

const GID_MASK: u8 = 0x0f;
const OID_MASK: u8 = 0x3f;

/// Message Type (MT) field of the packet header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Data packet
    Data,
    /// Control packet, command
    Command,
    /// Control packet, response
    Response,
    /// Control packet, notification
    Notification,
}

impl From<nci::MessageType> for MessageType {
    fn from(mt: nci::MessageType) -> Self {
        match mt {
            nci::MessageType::Data => MessageType::Data,
            nci::MessageType::Command => MessageType::Command,
            nci::MessageType::Response => MessageType::Response,
            nci::MessageType::Notification => MessageType::Notification,
        }
    }
}

impl From<MessageType> for nci::MessageType {
    fn from(mt: MessageType) -> Self {
        match mt {
            MessageType::Data => nci::MessageType::Data,
            MessageType::Command => nci::MessageType::Command,
            MessageType::Response => nci::MessageType::Response,
            MessageType::Notification => nci::MessageType::Notification,
        }
    }
}

/// Packet Boundary Flag (PBF) field of the packet header.
pub use nci::PacketBoundaryFlag;

/// Group and opcode identifiers of a control message.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Opcode {
    /// Group Identifier
    pub gid: u8,
    /// Opcode Identifier
    pub oid: u8,
}

impl Opcode {
    /// CORE_RESET_CMD/RSP/NTF
    pub const CORE_RESET: Opcode = Opcode::new(0x0, 0x00);
    /// CORE_INIT_CMD/RSP
    pub const CORE_INIT: Opcode = Opcode::new(0x0, 0x01);
    /// CORE_SET_CONFIG_CMD/RSP
    pub const CORE_SET_CONFIG: Opcode = Opcode::new(0x0, 0x02);
    /// CORE_GET_CONFIG_CMD/RSP
    pub const CORE_GET_CONFIG: Opcode = Opcode::new(0x0, 0x03);
    /// CORE_CONN_CREATE_CMD/RSP
    pub const CORE_CONN_CREATE: Opcode = Opcode::new(0x0, 0x04);
    /// CORE_CONN_CLOSE_CMD/RSP
    pub const CORE_CONN_CLOSE: Opcode = Opcode::new(0x0, 0x05);
    /// CORE_CONN_CREDITS_NTF
    pub const CORE_CONN_CREDITS: Opcode = Opcode::new(0x0, 0x06);
    /// CORE_GENERIC_ERROR_NTF
    pub const CORE_GENERIC_ERROR: Opcode = Opcode::new(0x0, 0x07);
    /// CORE_INTERFACE_ERROR_NTF
    pub const CORE_INTERFACE_ERROR: Opcode = Opcode::new(0x0, 0x08);
    /// RF_DISCOVER_MAP_CMD/RSP
    pub const RF_DISCOVER_MAP: Opcode = Opcode::new(0x1, 0x00);
    /// RF_DISCOVER_CMD/RSP/NTF
    pub const RF_DISCOVER: Opcode = Opcode::new(0x1, 0x03);
    /// RF_DISCOVER_SELECT_CMD/RSP
    pub const RF_DISCOVER_SELECT: Opcode = Opcode::new(0x1, 0x04);
    /// RF_INTF_ACTIVATED_NTF
    pub const RF_INTF_ACTIVATED: Opcode = Opcode::new(0x1, 0x05);
    /// RF_DEACTIVATE_CMD/RSP/NTF
    pub const RF_DEACTIVATE: Opcode = Opcode::new(0x1, 0x06);
    /// NFCEE_DISCOVER_CMD/RSP
    pub const NFCEE_DISCOVER: Opcode = Opcode::new(0x2, 0x00);

    /// Proprietary group identifier.
    pub const GID_PROPRIETARY: u8 = 0xf;

    /// Build an opcode, masking the identifiers to their field width.
    pub const fn new(gid: u8, oid: u8) -> Opcode {
        Opcode { gid: gid & GID_MASK, oid: oid & OID_MASK }
    }

    /// Whether the opcode belongs to the proprietary group.
    pub fn is_proprietary(&self) -> bool {
        self.gid == Self::GID_PROPRIETARY
    }

    fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Opcode::CORE_RESET => "CORE_RESET",
            Opcode::CORE_INIT => "CORE_INIT",
            Opcode::CORE_SET_CONFIG => "CORE_SET_CONFIG",
            Opcode::CORE_GET_CONFIG => "CORE_GET_CONFIG",
            Opcode::CORE_CONN_CREATE => "CORE_CONN_CREATE",
            Opcode::CORE_CONN_CLOSE => "CORE_CONN_CLOSE",
            Opcode::CORE_CONN_CREDITS => "CORE_CONN_CREDITS",
            Opcode::CORE_GENERIC_ERROR => "CORE_GENERIC_ERROR",
            Opcode::CORE_INTERFACE_ERROR => "CORE_INTERFACE_ERROR",
            Opcode::RF_DISCOVER_MAP => "RF_DISCOVER_MAP",
            Opcode::RF_DISCOVER => "RF_DISCOVER",
            Opcode::RF_DISCOVER_SELECT => "RF_DISCOVER_SELECT",
            Opcode::RF_INTF_ACTIVATED => "RF_INTF_ACTIVATED",
            Opcode::RF_DEACTIVATE => "RF_DEACTIVATE",
            Opcode::NFCEE_DISCOVER => "NFCEE_DISCOVER",
            _ => return None,
        })
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Opcode(gid={:#x}, oid={:#04x})", self.gid, self.oid),
        }
    }
}

/// Logical channel a message travels on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Control message identified by its opcode
    Control(Opcode),
    /// Data message on a logical connection
    Data {
        /// Logical connection identifier
        conn_id: u8,
    },
}

/// Common NCI packet header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// Message type
    pub mt: MessageType,
    /// Segmentation flag
    pub pbf: PacketBoundaryFlag,
    /// Opcode or connection identifier
    pub channel: Channel,
    /// Length of the payload following the header
    pub payload_length: u8,
}

impl PacketHeader {
    /// Parse the 3-byte header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<PacketHeader> {
        let raw = bytes
            .get(..HEADER_SIZE)
            .ok_or_else(|| NciError::Framing(format!("short header: {:02x?}", bytes)))?;
        let header = nci::PacketHeader::parse(raw).map_err(|e| malformed("packet header", e))?;
        let mt = MessageType::from(header.get_mt());
        let channel = match mt {
            MessageType::Data => Channel::Data { conn_id: header.get_gid() },
            _ => Channel::Control(Opcode::new(header.get_gid(), header.get_oid())),
        };
        Ok(PacketHeader {
            mt,
            pbf: header.get_pbf(),
            channel,
            payload_length: header.get_payload_length(),
        })
    }

    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let (gid, oid) = match self.channel {
            Channel::Control(op) => (op.gid, op.oid),
            Channel::Data { conn_id } => (conn_id & GID_MASK, 0),
        };
        let header = nci::PacketHeaderBuilder {
            gid,
            pbf: self.pbf,
            mt: self.mt.into(),
            oid,
            payload_length: self.payload_length,
        }
        .build();
        let mut bytes = [0; HEADER_SIZE];
        bytes.copy_from_slice(&header.to_vec());
        bytes
    }
}

/// A complete (reassembled) NCI message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Message type
    pub mt: MessageType,
    /// Opcode or connection identifier
    pub channel: Channel,
    /// Message payload
    pub payload: Bytes,
}

impl Message {
    /// Build a command.
    pub fn command(opcode: Opcode, payload: impl Into<Bytes>) -> Message {
        Message {
            mt: MessageType::Command,
            channel: Channel::Control(opcode),
            payload: payload.into(),
        }
    }

    /// Build a response.
    pub fn response(opcode: Opcode, payload: impl Into<Bytes>) -> Message {
        Message {
            mt: MessageType::Response,
            channel: Channel::Control(opcode),
            payload: payload.into(),
        }
    }

    /// Build a notification.
    pub fn notification(opcode: Opcode, payload: impl Into<Bytes>) -> Message {
        Message {
            mt: MessageType::Notification,
            channel: Channel::Control(opcode),
            payload: payload.into(),
        }
    }

    /// Build a data message.
    pub fn data(conn_id: u8, payload: impl Into<Bytes>) -> Message {
        Message {
            mt: MessageType::Data,
            channel: Channel::Data { conn_id },
            payload: payload.into(),
        }
    }

    /// Opcode of a control message.
    pub fn opcode(&self) -> Option<Opcode> {
        match self.channel {
            Channel::Control(op) => Some(op),
            Channel::Data { .. } => None,
        }
    }

    /// Total payload length.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Status carried in the first octet of a response.
    pub fn status(&self) -> Result<Status> {
        self.payload
            .first()
            .map(|s| Status::from_byte(*s))
            .ok_or_else(|| NciError::Framing(format!("{:?} has no status", self.opcode())))
    }
}

/// NCI status codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[allow(missing_docs)]
pub enum Status {
    Ok = 0x00,
    Rejected = 0x01,
    RfFrameCorrupted = 0x02,
    Failed = 0x03,
    NotInitialized = 0x04,
    SyntaxError = 0x05,
    SemanticError = 0x06,
    InvalidParam = 0x09,
    MessageSizeExceeded = 0x0a,
    DiscoveryAlreadyStarted = 0xa0,
    DiscoveryTargetActivationFailed = 0xa1,
    DiscoveryTearDown = 0xa2,
    RfTransmissionError = 0xb0,
    RfProtocolError = 0xb1,
    RfTimeoutError = 0xb2,
    NfceeInterfaceActivationFailed = 0xc0,
    NfceeTransmissionError = 0xc1,
    NfceeProtocolError = 0xc2,
    NfceeTimeoutError = 0xc3,
}

impl Status {
    /// Decode a status byte. Unknown values map to `Failed`.
    pub fn from_byte(value: u8) -> Status {
        Status::from_u8(value).unwrap_or(Status::Failed)
    }

    /// Convert a non-OK status into an error.
    pub fn check(self) -> Result<()> {
        match self {
            Status::Ok => Ok(()),
            status => Err(NciError::Status(status)),
        }
    }
}

/// RF protocols.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[allow(missing_docs)]
pub enum RfProtocol {
    Undetermined = 0x00,
    T1t = 0x01,
    T2t = 0x02,
    T3t = 0x03,
    IsoDep = 0x04,
    NfcDep = 0x05,
    T5t = 0x06,
    Ndef = 0x07,
}

impl RfProtocol {
    /// Decode a protocol byte. Proprietary values map to `Undetermined`.
    pub fn from_byte(value: u8) -> RfProtocol {
        RfProtocol::from_u8(value).unwrap_or(RfProtocol::Undetermined)
    }
}

/// RF interfaces.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[allow(missing_docs)]
pub enum RfInterface {
    NfceeDirect = 0x00,
    Frame = 0x01,
    IsoDep = 0x02,
    NfcDep = 0x03,
    NdefInterface = 0x06,
    Proprietary = 0x80,
}

impl RfInterface {
    /// Decode an interface byte. Unknown values map to `Proprietary`.
    pub fn from_byte(value: u8) -> RfInterface {
        RfInterface::from_u8(value).unwrap_or(RfInterface::Proprietary)
    }
}

/// RF technology and mode. Bit 7 selects listen mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RfTechnologyAndMode(pub u8);

#[allow(missing_docs)]
impl RfTechnologyAndMode {
    pub const NFC_A_PASSIVE_POLL: Self = Self(0x00);
    pub const NFC_B_PASSIVE_POLL: Self = Self(0x01);
    pub const NFC_F_PASSIVE_POLL: Self = Self(0x02);
    pub const NFC_V_PASSIVE_POLL: Self = Self(0x06);
    pub const NFC_A_PASSIVE_LISTEN: Self = Self(0x80);
    pub const NFC_B_PASSIVE_LISTEN: Self = Self(0x81);
    pub const NFC_F_PASSIVE_LISTEN: Self = Self(0x82);

    /// Whether this is a listen mode.
    pub fn is_listen(&self) -> bool {
        self.0 & 0x80 != 0
    }
}

/// Type of RF deactivation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[allow(missing_docs)]
pub enum DeactivationType {
    IdleMode = 0,
    SleepMode = 1,
    SleepAfMode = 2,
    Discovery = 3,
}

/// Reason of an RF deactivation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[allow(missing_docs)]
pub enum DeactivationReason {
    DhRequest = 0,
    EndpointRequest = 1,
    RfLinkLoss = 2,
    NfcBBadAfi = 3,
    DhRequestFailed = 4,
}

/// Reset type of CORE_RESET_CMD.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ResetType {
    KeepConfig = 0,
    ResetConfig = 1,
}

/// Reset trigger reported by CORE_RESET_NTF.
pub mod reset_trigger {
    /// Unrecoverable error in the NFCC
    pub const UNRECOVERABLE_ERROR: u8 = 0x00;
    /// NFCC powered on
    pub const POWER_ON: u8 = 0x01;
    /// CORE_RESET_CMD received
    pub const RESET_COMMAND: u8 = 0x02;
}

fn malformed(what: &str, error: impl fmt::Debug) -> NciError {
    NciError::Framing(format!("malformed {}: {:?}", what, error))
}

/// NCI version reported by a CORE_RESET_RSP. Only NCI 1.x responses carry
/// it; NCI 2.0 defers it to CORE_RESET_NTF.
pub fn reset_response_version(payload: &[u8]) -> Option<u8> {
    match payload.len() {
        0 | 1 => None,
        _ => nci::CoreResetResponse::parse(payload).ok().map(|rsp| rsp.get_nci_version()),
    }
}

/// CORE_RESET_NTF
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResetNotification {
    /// What caused the reset
    pub trigger: u8,
    /// Whether configuration was kept
    pub config_status: u8,
    /// NCI version implemented by the NFCC
    pub nci_version: u8,
    /// Manufacturer identifier
    pub manufacturer_id: u8,
    /// Manufacturer specific information
    pub manufacturer_info: Bytes,
}

impl ResetNotification {
    /// Parse the notification payload.
    pub fn parse(payload: &[u8]) -> Result<ResetNotification> {
        let ntf = nci::CoreResetNotification::parse(payload)
            .map_err(|e| malformed("CORE_RESET_NTF", e))?;
        Ok(ResetNotification {
            trigger: ntf.get_trigger(),
            config_status: ntf.get_config_status(),
            nci_version: ntf.get_nci_version(),
            manufacturer_id: ntf.get_manufacturer_id(),
            manufacturer_info: Bytes::copy_from_slice(ntf.get_manufacturer_specific_information()),
        })
    }

    /// Whether the reset was requested by the host.
    pub fn is_command_triggered(&self) -> bool {
        self.trigger == reset_trigger::RESET_COMMAND
    }
}

/// The fields of CORE_INIT_RSP the engine negotiates with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitResponse {
    /// Response status
    pub status: Status,
    /// Maximum number of dynamic logical connections
    pub max_logical_connections: u8,
    /// Maximum control packet payload the NFCC accepts
    pub max_control_payload: u8,
    /// Supported RF interfaces
    pub interfaces: Vec<RfInterface>,
}

impl InitResponse {
    /// Parse the response payload. The layout depends on the NCI version
    /// announced during reset.
    pub fn parse(payload: &[u8], nci_version: u8) -> Result<InitResponse> {
        let status = payload
            .first()
            .map(|s| Status::from_byte(*s))
            .ok_or_else(|| malformed("CORE_INIT_RSP", payload))?;
        status.check()?;
        if nci_version >= NCI_VERSION_2_0 {
            let rsp = nci::CoreInitResponse::parse(payload)
                .map_err(|e| malformed("CORE_INIT_RSP", e))?;
            Ok(InitResponse {
                status,
                max_logical_connections: rsp.get_max_logical_connections(),
                max_control_payload: rsp.get_max_control_packet_payload_size(),
                interfaces: rsp
                    .get_supported_rf_interfaces()
                    .iter()
                    .map(|info| RfInterface::from_byte(info.interface))
                    .collect(),
            })
        } else {
            let rsp = nci::CoreInitResponseV1::parse(payload)
                .map_err(|e| malformed("CORE_INIT_RSP", e))?;
            Ok(InitResponse {
                status,
                max_logical_connections: rsp.get_max_logical_connections(),
                max_control_payload: rsp.get_max_control_packet_payload_size(),
                interfaces: rsp
                    .get_supported_rf_interfaces()
                    .iter()
                    .map(|i| RfInterface::from_byte(*i))
                    .collect(),
            })
        }
    }
}

/// CORE_GENERIC_ERROR_NTF
pub fn parse_generic_error(payload: &[u8]) -> Result<Status> {
    let ntf = nci::CoreGenericErrorNotification::parse(payload)
        .map_err(|e| malformed("CORE_GENERIC_ERROR_NTF", e))?;
    Ok(Status::from_byte(ntf.get_status()))
}

/// CORE_INTERFACE_ERROR_NTF, as (status, conn id).
pub fn parse_interface_error(payload: &[u8]) -> Result<(Status, u8)> {
    let ntf = nci::CoreInterfaceErrorNotification::parse(payload)
        .map_err(|e| malformed("CORE_INTERFACE_ERROR_NTF", e))?;
    Ok((Status::from_byte(ntf.get_status()), ntf.get_conn_id()))
}

/// RF_DISCOVER_NTF
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryResult {
    /// RF Discovery ID assigned by the NFCC
    pub discovery_id: u8,
    /// Protocol of the remote endpoint
    pub protocol: RfProtocol,
    /// Technology and mode the endpoint was discovered with
    pub technology: RfTechnologyAndMode,
    /// Technology specific parameters
    pub parameters: Bytes,
    /// More notifications follow
    pub more: bool,
}

impl DiscoveryResult {
    /// Parse the notification payload.
    pub fn parse(payload: &[u8]) -> Result<DiscoveryResult> {
        const MORE_NOTIFICATIONS: u8 = 2;
        let ntf = nci::RfDiscoverNotification::parse(payload)
            .map_err(|e| malformed("RF_DISCOVER_NTF", e))?;
        Ok(DiscoveryResult {
            discovery_id: ntf.get_rf_discovery_id(),
            protocol: RfProtocol::from_byte(ntf.get_rf_protocol()),
            technology: RfTechnologyAndMode(ntf.get_rf_technology_and_mode()),
            parameters: Bytes::copy_from_slice(ntf.get_rf_technology_specific_parameters()),
            more: ntf.get_notification_type() == MORE_NOTIFICATIONS,
        })
    }
}

/// RF_INTF_ACTIVATED_NTF
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Activation {
    /// RF Discovery ID of the activated endpoint
    pub discovery_id: u8,
    /// Activated RF interface
    pub interface: RfInterface,
    /// Protocol of the remote endpoint
    pub protocol: RfProtocol,
    /// Technology and mode used for activation
    pub technology: RfTechnologyAndMode,
    /// Maximum data packet payload on the static RF connection
    pub max_data_payload: u8,
    /// Initial credits on the static RF connection
    pub initial_credits: u8,
    /// Technology specific parameters
    pub parameters: Bytes,
    /// Interface specific activation parameters (ATS, ATR_RES...)
    pub activation_parameters: Bytes,
}

impl Activation {
    /// Parse the notification payload.
    pub fn parse(payload: &[u8]) -> Result<Activation> {
        let ntf = nci::RfIntfActivatedNotification::parse(payload)
            .map_err(|e| malformed("RF_INTF_ACTIVATED_NTF", e))?;
        Ok(Activation {
            discovery_id: ntf.get_rf_discovery_id(),
            interface: RfInterface::from_byte(ntf.get_rf_interface()),
            protocol: RfProtocol::from_byte(ntf.get_rf_protocol()),
            technology: RfTechnologyAndMode(ntf.get_activation_rf_technology_and_mode()),
            max_data_payload: ntf.get_max_data_packet_payload_size(),
            initial_credits: ntf.get_initial_number_of_credits(),
            parameters: Bytes::copy_from_slice(ntf.get_rf_technology_specific_parameters()),
            activation_parameters: Bytes::copy_from_slice(ntf.get_activation_parameters()),
        })
    }
}

/// RF_DEACTIVATE_NTF
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Deactivation {
    /// Requested deactivation type
    pub kind: DeactivationType,
    /// Why the link was deactivated
    pub reason: DeactivationReason,
}

impl Deactivation {
    /// Parse the notification payload.
    pub fn parse(payload: &[u8]) -> Result<Deactivation> {
        let ntf = nci::RfDeactivateNotification::parse(payload)
            .map_err(|e| malformed("RF_DEACTIVATE_NTF", e))?;
        let (kind, reason) = (ntf.get_deactivation_type(), ntf.get_deactivation_reason());
        let kind = DeactivationType::from_u8(kind)
            .ok_or_else(|| NciError::Framing(format!("invalid deactivation type {}", kind)))?;
        let reason = DeactivationReason::from_u8(reason)
            .ok_or_else(|| NciError::Framing(format!("invalid deactivation reason {}", reason)))?;
        Ok(Deactivation { kind, reason })
    }
}

/// Parse CORE_CONN_CREDITS_NTF into (conn id, credits) pairs.
pub fn parse_conn_credits(payload: &[u8]) -> Result<Vec<(u8, u8)>> {
    let ntf = nci::CoreConnCreditsNotification::parse(payload)
        .map_err(|e| malformed("CORE_CONN_CREDITS_NTF", e))?;
    Ok(ntf.get_connections().iter().map(|c| (c.conn_id, c.credits)).collect())
}

/// CORE_RESET_CMD
pub fn core_reset_cmd(reset_type: ResetType) -> Message {
    let cmd = nci::CoreResetCommandBuilder { reset_type: reset_type as u8 }.build();
    Message::command(Opcode::CORE_RESET, cmd.to_vec())
}

/// CORE_INIT_CMD. NCI 2.0 adds a two byte feature enable field.
pub fn core_init_cmd(nci_version: u8) -> Message {
    if nci_version >= NCI_VERSION_2_0 {
        let cmd = nci::CoreInitCommandBuilder { feature_enable: 0 }.build();
        Message::command(Opcode::CORE_INIT, cmd.to_vec())
    } else {
        Message::command(Opcode::CORE_INIT, Bytes::new())
    }
}

/// RF_DISCOVER_MAP_CMD mapping each protocol to its natural interface in
/// poll and listen modes.
pub fn rf_discover_map_cmd() -> Message {
    const POLL: u8 = 0x01;
    const POLL_AND_LISTEN: u8 = 0x03;
    let mappings = [
        (RfProtocol::T1t, POLL, RfInterface::Frame),
        (RfProtocol::T2t, POLL, RfInterface::Frame),
        (RfProtocol::T3t, POLL, RfInterface::Frame),
        (RfProtocol::T5t, POLL, RfInterface::Frame),
        (RfProtocol::IsoDep, POLL_AND_LISTEN, RfInterface::IsoDep),
        (RfProtocol::NfcDep, POLL_AND_LISTEN, RfInterface::NfcDep),
    ];
    let cmd = nci::RfDiscoverMapCommandBuilder {
        mapping_configurations: mappings
            .iter()
            .map(|(protocol, mode, interface)| nci::MappingConfiguration {
                rf_protocol: *protocol as u8,
                mode: *mode,
                rf_interface: *interface as u8,
            })
            .collect(),
    }
    .build();
    Message::command(Opcode::RF_DISCOVER_MAP, cmd.to_vec())
}

/// RF_DISCOVER_CMD, every technology polled or listened at each period.
pub fn rf_discover_cmd(modes: &[RfTechnologyAndMode]) -> Message {
    let cmd = nci::RfDiscoverCommandBuilder {
        configurations: modes
            .iter()
            .map(|mode| nci::DiscoverConfiguration {
                technology_and_mode: mode.0,
                discovery_frequency: 1,
            })
            .collect(),
    }
    .build();
    Message::command(Opcode::RF_DISCOVER, cmd.to_vec())
}

/// RF_DISCOVER_SELECT_CMD
pub fn rf_discover_select_cmd(
    discovery_id: u8,
    protocol: RfProtocol,
    interface: RfInterface,
) -> Message {
    let cmd = nci::RfDiscoverSelectCommandBuilder {
        rf_discovery_id: discovery_id,
        rf_protocol: protocol as u8,
        rf_interface: interface as u8,
    }
    .build();
    Message::command(Opcode::RF_DISCOVER_SELECT, cmd.to_vec())
}

/// RF_DEACTIVATE_CMD
pub fn rf_deactivate_cmd(kind: DeactivationType) -> Message {
    let cmd = nci::RfDeactivateCommandBuilder { deactivation_type: kind as u8 }.build();
    Message::command(Opcode::RF_DEACTIVATE, cmd.to_vec())
}
