//! # Mesh Packets
//!
//! The logical packets exchanged between hubs. Each packet is one frame on the
//! transport: a one-byte tag followed by a fixed, tag-specific payload.
//!
//! ## Invariants
//!
//! - An encoded packet never exceeds `MAX_PACKET_SIZE`; oversized packets fail
//!   in `encode` before anything reaches a transport.
//! - Nested payloads (`RetransmitTo`, `Call`, `Result`, stream data) are carried
//!   in `u16` sized sections and stay opaque at this layer.
//! - Unknown tags and trailing bytes are decode errors.

use meshpack::Decoder;
use meshpack::Encoder;

use crate::error::Error;
use crate::error::Result;

/// A hub's 64-bit identity.
pub type HubId = i64;

/// The largest packet a frame can carry.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

pub mod tag {
    pub const HELLO: u8 = 0x01;
    pub const HELLO_RESPONSE: u8 = 0x02;
    pub const HUB_IS_AVAILABLE: u8 = 0x03;
    pub const HUB_IS_UNAVAILABLE: u8 = 0x04;
    pub const DISCONNECT: u8 = 0x05;
    pub const READY_FOR_DISCONNECT: u8 = 0x06;
    pub const REGISTER_INTERFACE: u8 = 0x07;
    pub const UNREGISTER_INTERFACE: u8 = 0x08;
    pub const RETRANSMIT_TO: u8 = 0x09;
    pub const CALL: u8 = 0x0A;
    pub const RESULT: u8 = 0x0B;
    pub const EXCEPTION: u8 = 0x0C;
    pub const ERROR: u8 = 0x0D;
    pub const STREAM_INFO_REQUEST: u8 = 0x10;
    pub const STREAM_INFO: u8 = 0x11;
    pub const STREAM_READ: u8 = 0x12;
    pub const STREAM_WRITE: u8 = 0x13;
    pub const STREAM_SEEK: u8 = 0x14;
    pub const STREAM_CLOSE: u8 = 0x15;
    pub const STREAM_DATA: u8 = 0x16;
    pub const STREAM_ACK: u8 = 0x17;
}

/// Codes carried by `Packet::Error`.
pub mod error_code {
    pub const PROTOCOL: i32 = 1;
    pub const NOT_RELAYING: i32 = 2;
    pub const UNKNOWN_HUB: i32 = 3;
    pub const HUB_ID_COLLISION: i32 = 4;
}

/// One provider of a shared interface: which hub, its local id there, and the version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceLink {
    pub hub: HubId,
    pub id: u32,
    pub version: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Hello { hub: HubId, name: String },
    HelloResponse { hub: HubId, name: String },
    HubIsAvailable { hub: HubId, name: String, distance: i32 },
    HubIsUnavailable { hub: HubId },
    Disconnect,
    ReadyForDisconnect,
    RegisterInterface { name: String, links: Vec<InterfaceLink> },
    UnregisterInterface { name: String, hub: HubId },
    RetransmitTo { receiver: HubId, sender: HubId, packet: Vec<u8> },
    Call { await_id: i32, interface: u32, descriptor: Vec<u8> },
    Result { await_id: i32, value: Vec<u8> },
    Exception { await_id: i32, message: String },
    Error { code: i32, message: String },
    StreamInfoRequest { await_id: i32, stream: u32 },
    StreamInfo { await_id: i32, length: i64, position: i64, flags: u8 },
    StreamRead { await_id: i32, stream: u32, len: i32 },
    StreamWrite { await_id: i32, stream: u32, data: Vec<u8> },
    StreamSeek { await_id: i32, stream: u32, position: i64 },
    StreamClose { await_id: i32, stream: u32 },
    StreamData { await_id: i32, data: Vec<u8> },
    StreamAck { await_id: i32, position: i64 },
}

fn too_large(e: meshpack::Error) -> Error {
    match e {
        meshpack::Error::SectionTooLarge(n) => Error::PacketTooLarge(n),
        other => Error::Pack(other),
    }
}

impl Packet {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Hello { .. } => "Hello",
            Packet::HelloResponse { .. } => "HelloResponse",
            Packet::HubIsAvailable { .. } => "HubIsAvailable",
            Packet::HubIsUnavailable { .. } => "HubIsUnavailable",
            Packet::Disconnect => "Disconnect",
            Packet::ReadyForDisconnect => "ReadyForDisconnect",
            Packet::RegisterInterface { .. } => "RegisterInterface",
            Packet::UnregisterInterface { .. } => "UnregisterInterface",
            Packet::RetransmitTo { .. } => "RetransmitTo",
            Packet::Call { .. } => "Call",
            Packet::Result { .. } => "Result",
            Packet::Exception { .. } => "Exception",
            Packet::Error { .. } => "Error",
            Packet::StreamInfoRequest { .. } => "StreamInfoRequest",
            Packet::StreamInfo { .. } => "StreamInfo",
            Packet::StreamRead { .. } => "StreamRead",
            Packet::StreamWrite { .. } => "StreamWrite",
            Packet::StreamSeek { .. } => "StreamSeek",
            Packet::StreamClose { .. } => "StreamClose",
            Packet::StreamData { .. } => "StreamData",
            Packet::StreamAck { .. } => "StreamAck",
        }
    }

    /// The correlation id of requests and replies that carry one.
    pub fn await_id(&self) -> Option<i32> {
        match self {
            Packet::Call { await_id, .. }
            | Packet::Result { await_id, .. }
            | Packet::Exception { await_id, .. }
            | Packet::StreamInfoRequest { await_id, .. }
            | Packet::StreamInfo { await_id, .. }
            | Packet::StreamRead { await_id, .. }
            | Packet::StreamWrite { await_id, .. }
            | Packet::StreamSeek { await_id, .. }
            | Packet::StreamClose { await_id, .. }
            | Packet::StreamData { await_id, .. }
            | Packet::StreamAck { await_id, .. } => Some(*await_id),
            _ => None,
        }
    }

    /// True for packets that expect an `Exception` when they cannot be delivered.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Packet::Call { .. }
                | Packet::StreamInfoRequest { .. }
                | Packet::StreamRead { .. }
                | Packet::StreamWrite { .. }
                | Packet::StreamSeek { .. }
                | Packet::StreamClose { .. }
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc).map_err(too_large)?;
        let bytes = enc.into_bytes().map_err(too_large)?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    fn encode_into(&self, enc: &mut Encoder) -> meshpack::Result<()> {
        match self {
            Packet::Hello { hub, name } => {
                enc.u8(tag::HELLO);
                enc.i64(*hub);
                enc.str(name)?;
            }
            Packet::HelloResponse { hub, name } => {
                enc.u8(tag::HELLO_RESPONSE);
                enc.i64(*hub);
                enc.str(name)?;
            }
            Packet::HubIsAvailable { hub, name, distance } => {
                enc.u8(tag::HUB_IS_AVAILABLE);
                enc.i64(*hub);
                enc.str(name)?;
                enc.i32(*distance);
            }
            Packet::HubIsUnavailable { hub } => {
                enc.u8(tag::HUB_IS_UNAVAILABLE);
                enc.i64(*hub);
            }
            Packet::Disconnect => enc.u8(tag::DISCONNECT),
            Packet::ReadyForDisconnect => enc.u8(tag::READY_FOR_DISCONNECT),
            Packet::RegisterInterface { name, links } => {
                enc.u8(tag::REGISTER_INTERFACE);
                enc.str(name)?;
                let count = u8::try_from(links.len()).map_err(|_| meshpack::Error::SectionTooLarge(links.len()))?;
                enc.u8(count);
                for link in links {
                    enc.i64(link.hub);
                    enc.u32(link.id);
                    enc.i32(link.version);
                }
            }
            Packet::UnregisterInterface { name, hub } => {
                enc.u8(tag::UNREGISTER_INTERFACE);
                enc.str(name)?;
                enc.i64(*hub);
            }
            Packet::RetransmitTo { receiver, sender, packet } => {
                enc.u8(tag::RETRANSMIT_TO);
                enc.i64(*receiver);
                enc.i64(*sender);
                enc.blob(packet)?;
            }
            Packet::Call { await_id, interface, descriptor } => {
                enc.u8(tag::CALL);
                enc.i32(*await_id);
                enc.u32(*interface);
                enc.blob(descriptor)?;
            }
            Packet::Result { await_id, value } => {
                enc.u8(tag::RESULT);
                enc.i32(*await_id);
                enc.blob(value)?;
            }
            Packet::Exception { await_id, message } => {
                enc.u8(tag::EXCEPTION);
                enc.i32(*await_id);
                enc.str(message)?;
            }
            Packet::Error { code, message } => {
                enc.u8(tag::ERROR);
                enc.i32(*code);
                enc.str(message)?;
            }
            Packet::StreamInfoRequest { await_id, stream } => {
                enc.u8(tag::STREAM_INFO_REQUEST);
                enc.i32(*await_id);
                enc.u32(*stream);
            }
            Packet::StreamInfo { await_id, length, position, flags } => {
                enc.u8(tag::STREAM_INFO);
                enc.i32(*await_id);
                enc.i64(*length);
                enc.i64(*position);
                enc.u8(*flags);
            }
            Packet::StreamRead { await_id, stream, len } => {
                enc.u8(tag::STREAM_READ);
                enc.i32(*await_id);
                enc.u32(*stream);
                enc.i32(*len);
            }
            Packet::StreamWrite { await_id, stream, data } => {
                enc.u8(tag::STREAM_WRITE);
                enc.i32(*await_id);
                enc.u32(*stream);
                enc.blob(data)?;
            }
            Packet::StreamSeek { await_id, stream, position } => {
                enc.u8(tag::STREAM_SEEK);
                enc.i32(*await_id);
                enc.u32(*stream);
                enc.i64(*position);
            }
            Packet::StreamClose { await_id, stream } => {
                enc.u8(tag::STREAM_CLOSE);
                enc.i32(*await_id);
                enc.u32(*stream);
            }
            Packet::StreamData { await_id, data } => {
                enc.u8(tag::STREAM_DATA);
                enc.i32(*await_id);
                enc.blob(data)?;
            }
            Packet::StreamAck { await_id, position } => {
                enc.u8(tag::STREAM_ACK);
                enc.i32(*await_id);
                enc.i64(*position);
            }
        }
        Ok(())
    }

    /// Decodes exactly one packet; trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        let mut dec = Decoder::new(bytes);
        let packet = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(packet)
    }

    fn decode_from(dec: &mut Decoder<'_>) -> Result<Packet> {
        let t = dec.u8()?;
        Ok(match t {
            tag::HELLO => Packet::Hello { hub: dec.i64()?, name: dec.str()? },
            tag::HELLO_RESPONSE => Packet::HelloResponse { hub: dec.i64()?, name: dec.str()? },
            tag::HUB_IS_AVAILABLE => Packet::HubIsAvailable { hub: dec.i64()?, name: dec.str()?, distance: dec.i32()? },
            tag::HUB_IS_UNAVAILABLE => Packet::HubIsUnavailable { hub: dec.i64()? },
            tag::DISCONNECT => Packet::Disconnect,
            tag::READY_FOR_DISCONNECT => Packet::ReadyForDisconnect,
            tag::REGISTER_INTERFACE => {
                let name = dec.str()?;
                let count = dec.u8()? as usize;
                let mut links = Vec::with_capacity(count);
                for _ in 0..count {
                    links.push(InterfaceLink { hub: dec.i64()?, id: dec.u32()?, version: dec.i32()? });
                }
                Packet::RegisterInterface { name, links }
            }
            tag::UNREGISTER_INTERFACE => Packet::UnregisterInterface { name: dec.str()?, hub: dec.i64()? },
            tag::RETRANSMIT_TO => Packet::RetransmitTo {
                receiver: dec.i64()?,
                sender: dec.i64()?,
                packet: dec.blob()?.to_vec(),
            },
            tag::CALL => Packet::Call { await_id: dec.i32()?, interface: dec.u32()?, descriptor: dec.blob()?.to_vec() },
            tag::RESULT => Packet::Result { await_id: dec.i32()?, value: dec.blob()?.to_vec() },
            tag::EXCEPTION => Packet::Exception { await_id: dec.i32()?, message: dec.str()? },
            tag::ERROR => Packet::Error { code: dec.i32()?, message: dec.str()? },
            tag::STREAM_INFO_REQUEST => Packet::StreamInfoRequest { await_id: dec.i32()?, stream: dec.u32()? },
            tag::STREAM_INFO => Packet::StreamInfo {
                await_id: dec.i32()?,
                length: dec.i64()?,
                position: dec.i64()?,
                flags: dec.u8()?,
            },
            tag::STREAM_READ => Packet::StreamRead { await_id: dec.i32()?, stream: dec.u32()?, len: dec.i32()? },
            tag::STREAM_WRITE => Packet::StreamWrite {
                await_id: dec.i32()?,
                stream: dec.u32()?,
                data: dec.blob()?.to_vec(),
            },
            tag::STREAM_SEEK => Packet::StreamSeek { await_id: dec.i32()?, stream: dec.u32()?, position: dec.i64()? },
            tag::STREAM_CLOSE => Packet::StreamClose { await_id: dec.i32()?, stream: dec.u32()? },
            tag::STREAM_DATA => Packet::StreamData { await_id: dec.i32()?, data: dec.blob()?.to_vec() },
            tag::STREAM_ACK => Packet::StreamAck { await_id: dec.i32()?, position: dec.i64()? },
            other => return Err(Error::Protocol(format!("unknown packet tag 0x{:02x}", other))),
        })
    }
}
