// codec.rs - ENIP encapsulation and CIP message wire formats
//
// Pure encode/decode for the two protocol layers the client speaks: the
// 24-byte EtherNet/IP encapsulation header with its Common Packet Format
// item list, and the CIP request/reply bodies carried inside the data
// items. All multi-byte integers are little-endian.

use crate::epath::CipPath;
use crate::error::{EnipLinkError, Result};
use crate::status::CipStatus;
use tracing::trace;

/// Encapsulation header size on the wire.
pub const ENCAP_HEADER_LEN: usize = 24;

/// CIP service codes used by this crate.
pub mod service {
    /// Get_Attribute_Single.
    pub const GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
    /// Set_Attribute_Single.
    pub const SET_ATTRIBUTE_SINGLE: u8 = 0x10;
    /// Connection Manager Unconnected Send.
    pub const UNCONNECTED_SEND: u8 = 0x52;
    /// Connection Manager Forward Open.
    pub const FORWARD_OPEN: u8 = 0x54;
    /// Connection Manager Forward Close.
    pub const FORWARD_CLOSE: u8 = 0x4E;
    /// Bit marking a reply service code.
    pub const REPLY_FLAG: u8 = 0x80;
}

/// CPF item type identifiers.
pub mod item_type {
    pub const NULL_ADDRESS: u16 = 0x0000;
    pub const CONNECTED_ADDRESS: u16 = 0x00A1;
    pub const CONNECTION_DATA: u16 = 0x00B1;
    pub const UNCONNECTED_DATA: u16 = 0x00B2;
}

/// Recognized encapsulation commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncapCommand {
    Nop,
    ListServices,
    ListIdentity,
    RegisterSession,
    UnregisterSession,
    SendRRData,
    SendUnitData,
}

impl EncapCommand {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0x0000 => Some(EncapCommand::Nop),
            0x0004 => Some(EncapCommand::ListServices),
            0x0063 => Some(EncapCommand::ListIdentity),
            0x0065 => Some(EncapCommand::RegisterSession),
            0x0066 => Some(EncapCommand::UnregisterSession),
            0x006F => Some(EncapCommand::SendRRData),
            0x0070 => Some(EncapCommand::SendUnitData),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            EncapCommand::Nop => 0x0000,
            EncapCommand::ListServices => 0x0004,
            EncapCommand::ListIdentity => 0x0063,
            EncapCommand::RegisterSession => 0x0065,
            EncapCommand::UnregisterSession => 0x0066,
            EncapCommand::SendRRData => 0x006F,
            EncapCommand::SendUnitData => 0x0070,
        }
    }
}

/// The 24-byte encapsulation header preceding every ENIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapHeader {
    pub command: EncapCommand,
    /// Byte count of the data following the header.
    pub length: u16,
    pub session_handle: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
}

impl EncapHeader {
    pub fn new(command: EncapCommand, session_handle: u32) -> Self {
        Self {
            command,
            length: 0,
            session_handle,
            status: 0,
            sender_context: [0u8; 8],
            options: 0,
        }
    }

    pub fn encode(&self) -> [u8; ENCAP_HEADER_LEN] {
        let mut out = [0u8; ENCAP_HEADER_LEN];
        out[0..2].copy_from_slice(&self.command.as_u16().to_le_bytes());
        out[2..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..8].copy_from_slice(&self.session_handle.to_le_bytes());
        out[8..12].copy_from_slice(&self.status.to_le_bytes());
        out[12..20].copy_from_slice(&self.sender_context);
        out[20..24].copy_from_slice(&self.options.to_le_bytes());
        out
    }

    /// Decode a header from exactly [`ENCAP_HEADER_LEN`] bytes. Fails with
    /// `MalformedFrame` on a short buffer or an unrecognized command.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ENCAP_HEADER_LEN {
            return Err(EnipLinkError::malformed(format!(
                "encapsulation header needs {ENCAP_HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let raw_command = u16::from_le_bytes([buf[0], buf[1]]);
        let command = EncapCommand::from_u16(raw_command).ok_or_else(|| {
            EnipLinkError::malformed(format!("unknown encapsulation command 0x{raw_command:04X}"))
        })?;
        let mut sender_context = [0u8; 8];
        sender_context.copy_from_slice(&buf[12..20]);
        Ok(Self {
            command,
            length: u16::from_le_bytes([buf[2], buf[3]]),
            session_handle: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            status: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            sender_context,
            options: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }
}

/// Assemble a full frame: header with `length` patched, then `body`.
pub fn encode_frame(command: EncapCommand, session_handle: u32, body: &[u8]) -> Vec<u8> {
    let mut header = EncapHeader::new(command, session_handle);
    header.length = body.len() as u16;
    let mut out = Vec::with_capacity(ENCAP_HEADER_LEN + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(body);
    out
}

/// RegisterSession request body: protocol version 1, option flags 0.
pub fn register_session_body() -> Vec<u8> {
    vec![0x01, 0x00, 0x00, 0x00]
}

/// One Common Packet Format item. Unknown `type_id` values seen in received
/// frames are preserved verbatim and surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpfItem {
    pub type_id: u16,
    pub data: Vec<u8>,
}

impl CpfItem {
    pub fn null_address() -> Self {
        Self {
            type_id: item_type::NULL_ADDRESS,
            data: Vec::new(),
        }
    }

    pub fn connected_address(connection_id: u32) -> Self {
        Self {
            type_id: item_type::CONNECTED_ADDRESS,
            data: connection_id.to_le_bytes().to_vec(),
        }
    }

    /// Class 3 data item: 2-byte sequence count followed by the CIP message.
    pub fn connection_data(sequence: u16, cip: &[u8]) -> Self {
        let mut data = Vec::with_capacity(2 + cip.len());
        data.extend_from_slice(&sequence.to_le_bytes());
        data.extend_from_slice(cip);
        Self {
            type_id: item_type::CONNECTION_DATA,
            data,
        }
    }

    pub fn unconnected_data(cip: Vec<u8>) -> Self {
        Self {
            type_id: item_type::UNCONNECTED_DATA,
            data: cip,
        }
    }
}

/// Body of a SendRRData / SendUnitData message: interface handle, timeout,
/// then the CPF item list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpfPacket {
    pub interface_handle: u32,
    pub timeout: u16,
    pub items: Vec<CpfItem>,
}

impl Default for CpfPacket {
    fn default() -> Self {
        Self {
            interface_handle: 0,
            timeout: 5,
            items: Vec::new(),
        }
    }
}

impl CpfPacket {
    pub fn new(items: Vec<CpfItem>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.interface_handle.to_le_bytes());
        out.extend_from_slice(&self.timeout.to_le_bytes());
        out.extend_from_slice(&(self.items.len() as u16).to_le_bytes());
        for item in &self.items {
            out.extend_from_slice(&item.type_id.to_le_bytes());
            out.extend_from_slice(&(item.data.len() as u16).to_le_bytes());
            out.extend_from_slice(&item.data);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(EnipLinkError::malformed("CPF body shorter than 8 bytes"));
        }
        let interface_handle = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let timeout = u16::from_le_bytes([buf[4], buf[5]]);
        let item_count = u16::from_le_bytes([buf[6], buf[7]]) as usize;
        let mut pos = 8;
        let mut items = Vec::with_capacity(item_count);
        for index in 0..item_count {
            if pos + 4 > buf.len() {
                return Err(EnipLinkError::malformed(format!(
                    "CPF truncated in item {index} header"
                )));
            }
            let type_id = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
            let length = u16::from_le_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            pos += 4;
            if pos + length > buf.len() {
                return Err(EnipLinkError::malformed(format!(
                    "CPF item {index} declares {length} bytes past the buffer"
                )));
            }
            trace!(type_id = %format!("0x{type_id:04X}"), length, "decoded CPF item");
            items.push(CpfItem {
                type_id,
                data: buf[pos..pos + length].to_vec(),
            });
            pos += length;
        }
        Ok(Self {
            interface_handle,
            timeout,
            items,
        })
    }

    pub fn find(&self, type_id: u16) -> Option<&CpfItem> {
        self.items.iter().find(|item| item.type_id == type_id)
    }
}

/// A CIP service request: service code, EPATH, request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipRequest {
    pub service: u8,
    pub path: CipPath,
    pub data: Vec<u8>,
}

impl CipRequest {
    pub fn new(service: u8, path: CipPath, data: Vec<u8>) -> Self {
        Self {
            service,
            path,
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.path.validate()?;
        let path_bytes = self.path.encode();
        let mut out = Vec::with_capacity(2 + path_bytes.len() + self.data.len());
        out.push(self.service);
        out.push((path_bytes.len() / 2) as u8);
        out.extend_from_slice(&path_bytes);
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(EnipLinkError::malformed("CIP request shorter than 2 bytes"));
        }
        let service = buf[0];
        let path_words = buf[1];
        let path_len = path_words as usize * 2;
        if 2 + path_len > buf.len() {
            return Err(EnipLinkError::malformed(
                "CIP request path exceeds the buffer",
            ));
        }
        let path = CipPath::decode(&buf[2..2 + path_len], path_words)?;
        Ok(Self {
            service,
            path,
            data: buf[2 + path_len..].to_vec(),
        })
    }
}

/// A CIP service reply: echoed service code with the reply bit set, status,
/// reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipReply {
    pub service: u8,
    pub status: CipStatus,
    pub data: Vec<u8>,
}

impl CipReply {
    pub fn success(request_service: u8, data: Vec<u8>) -> Self {
        Self {
            service: request_service | service::REPLY_FLAG,
            status: CipStatus::SUCCESS,
            data,
        }
    }

    pub fn with_status(request_service: u8, status: CipStatus, data: Vec<u8>) -> Self {
        Self {
            service: request_service | service::REPLY_FLAG,
            status,
            data,
        }
    }

    /// The request service this reply answers, with the reply bit cleared.
    pub fn request_service(&self) -> u8 {
        self.service & !service::REPLY_FLAG
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.push(self.service);
        out.push(0x00); // reserved
        out.push(self.status.general);
        match self.status.extended {
            Some(ext) => {
                out.push(0x01);
                out.extend_from_slice(&ext.to_le_bytes());
            }
            None => out.push(0x00),
        }
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(EnipLinkError::malformed("CIP reply shorter than 4 bytes"));
        }
        let service = buf[0];
        if service & service::REPLY_FLAG == 0 {
            return Err(EnipLinkError::malformed(format!(
                "CIP reply service 0x{service:02X} lacks the reply bit"
            )));
        }
        let general = buf[2];
        let extended_words = buf[3] as usize;
        let extended_len = extended_words * 2;
        if 4 + extended_len > buf.len() {
            return Err(EnipLinkError::malformed(
                "CIP reply extended status exceeds the buffer",
            ));
        }
        // Only the first extended word is meaningful to callers; the rest is
        // skipped but still accounted for.
        let extended = if extended_words > 0 {
            Some(u16::from_le_bytes([buf[4], buf[5]]))
        } else {
            None
        };
        Ok(Self {
            service,
            status: CipStatus::new(general, extended),
            data: buf[4 + extended_len..].to_vec(),
        })
    }
}

/// How a CIP request travels to the device. The codec composes the CPF item
/// list by matching on this tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSelect {
    /// SendRRData with a NullAddress + UnconnectedData pair.
    Unconnected,
    /// Like [`TransportSelect::Unconnected`] but the CIP request is wrapped
    /// in a Connection Manager Unconnected Send (0x52) for one routed hop.
    UnconnectedSend,
    /// SendUnitData on an established Class 3 connection: ConnectedAddress
    /// carrying the O->T connection id, ConnectionData carrying the
    /// pre-incremented sequence count.
    Connected { connection_id: u32, sequence: u16 },
}

/// Default Unconnected Send route: backplane port 1, link address 0.
const UNCONNECTED_SEND_ROUTE: [u8; 2] = [0x01, 0x00];

/// Wrap a CIP request in the Unconnected Send service addressed to the
/// Connection Manager.
pub fn wrap_unconnected_send(cip: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(6 + cip.len() + UNCONNECTED_SEND_ROUTE.len());
    body.push(0x07); // priority / time tick
    body.push(0x0A); // timeout ticks
    body.extend_from_slice(&(cip.len() as u16).to_le_bytes());
    body.extend_from_slice(cip);
    if cip.len() % 2 != 0 {
        body.push(0x00);
    }
    body.push((UNCONNECTED_SEND_ROUTE.len() / 2) as u8);
    body.push(0x00); // reserved
    body.extend_from_slice(&UNCONNECTED_SEND_ROUTE);

    let request = CipRequest::new(
        service::UNCONNECTED_SEND,
        CipPath::make(0x06, 0x01),
        body,
    );
    request.encode()
}

/// Frame one CIP request into a complete ENIP message ready to write to the
/// socket, selecting the CPF composition from the transport tag.
pub fn build_cip_frame(
    session_handle: u32,
    request: &CipRequest,
    transport: &TransportSelect,
) -> Result<Vec<u8>> {
    let cip = request.encode()?;
    let (command, items) = match transport {
        TransportSelect::Unconnected => (
            EncapCommand::SendRRData,
            vec![CpfItem::null_address(), CpfItem::unconnected_data(cip)],
        ),
        TransportSelect::UnconnectedSend => (
            EncapCommand::SendRRData,
            vec![
                CpfItem::null_address(),
                CpfItem::unconnected_data(wrap_unconnected_send(&cip)?),
            ],
        ),
        TransportSelect::Connected {
            connection_id,
            sequence,
        } => (
            EncapCommand::SendUnitData,
            vec![
                CpfItem::connected_address(*connection_id),
                CpfItem::connection_data(*sequence, &cip),
            ],
        ),
    };
    let body = CpfPacket::new(items).encode();
    Ok(encode_frame(command, session_handle, body.as_slice()))
}
