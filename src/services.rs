// services.rs - Typed CIP operations layered over the session orchestrator
//
// Thin, stateless helpers: attribute get/set, assembly read/write, and the
// layout-aware decoding of a flat assembly buffer into named member values.

use crate::codec::service;
use crate::epath::CipPath;
use crate::error::{EnipLinkError, Result};
use crate::registry::{Assembly, AssemblyDirection, ASSEMBLY_DATA_ATTRIBUTE};
use crate::session::SessionManager;
use crate::status::CipStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// How [`SessionManager::send_command`] carries a request to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTransport {
    /// SendRRData, unconnected.
    Rr,
    /// SendRRData with an Unconnected Send routing hop.
    RrRouted,
    /// SendUnitData on the Class 3 connection.
    Unit,
}

/// Result of a low-level CIP command execution.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub status: CipStatus,
    pub payload: Vec<u8>,
}

/// Result of one assembly read.
#[derive(Debug, Clone, Serialize)]
pub struct AssemblyReadResult {
    pub class_id: u16,
    pub instance_id: u16,
    pub data: Vec<u8>,
    pub data_hex: String,
    /// Little-endian 16-bit interpretation, present only when the requested
    /// size is even.
    pub word_values: Option<Vec<u16>>,
    pub timestamp: DateTime<Utc>,
    pub status: CipStatus,
}

/// Decoded value of one assembly member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberValue {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub datatype: Option<String>,
    pub description: Option<String>,
    /// Hex rendering of the member bytes; empty when the member lies past
    /// the end of the buffer.
    pub raw_hex: String,
    /// Little-endian unsigned interpretation for 1/2/4-byte members.
    pub int_value: Option<u64>,
}

/// Live view of one configured assembly: payload plus decoded members.
#[derive(Debug, Clone, Serialize)]
pub struct AssemblyRuntimeView {
    pub alias: String,
    pub class_id: u16,
    pub instance_id: u16,
    pub direction: AssemblyDirection,
    pub size: Option<usize>,
    pub payload_hex: String,
    pub timestamp: DateTime<Utc>,
    pub status: CipStatus,
    pub word_values: Option<Vec<u16>>,
    pub members: Vec<MemberValue>,
}

impl SessionManager {
    /// Get_Attribute_Single (0x0E). Returns the raw attribute bytes.
    pub async fn get_attribute_single(
        &self,
        session_id: &str,
        path: CipPath,
    ) -> Result<Vec<u8>> {
        let (status, data) = self
            .dispatch_unit(session_id, service::GET_ATTRIBUTE_SINGLE, path, Vec::new())
            .await?;
        if !status.is_ok() {
            return Err(EnipLinkError::Cip { status });
        }
        Ok(data)
    }

    /// Set_Attribute_Single (0x10).
    pub async fn set_attribute_single(
        &self,
        session_id: &str,
        path: CipPath,
        value: Vec<u8>,
    ) -> Result<()> {
        let (status, _) = self
            .dispatch_unit(session_id, service::SET_ATTRIBUTE_SINGLE, path, value)
            .await?;
        if !status.is_ok() {
            return Err(EnipLinkError::Cip { status });
        }
        Ok(())
    }

    /// Read the Data attribute of an assembly instance over the Class 3
    /// connection. A non-zero CIP status is carried in the result, not
    /// raised.
    pub async fn read_assembly(
        &self,
        session_id: &str,
        class_id: u16,
        instance_id: u16,
        total_size: usize,
    ) -> Result<AssemblyReadResult> {
        let path = CipPath::make_attribute(class_id, instance_id, ASSEMBLY_DATA_ATTRIBUTE);
        let (status, data) = self
            .dispatch_unit(session_id, service::GET_ATTRIBUTE_SINGLE, path, Vec::new())
            .await?;
        let word_values = if total_size % 2 == 0 {
            decode_words(&data)
        } else {
            None
        };
        Ok(AssemblyReadResult {
            class_id,
            instance_id,
            data_hex: hex::encode(&data),
            data,
            word_values,
            timestamp: Utc::now(),
            status,
        })
    }

    /// Write the Data attribute of an assembly instance addressed by
    /// explicit path. The CIP status is the return value.
    pub async fn write_assembly(
        &self,
        session_id: &str,
        class_id: u16,
        instance_id: u16,
        payload: Vec<u8>,
    ) -> Result<CipStatus> {
        let path = CipPath::make_attribute(class_id, instance_id, ASSEMBLY_DATA_ATTRIBUTE);
        let (status, _) = self
            .dispatch_unit(session_id, service::SET_ATTRIBUTE_SINGLE, path, payload)
            .await?;
        Ok(status)
    }

    /// Write an assembly addressed by its configured alias. The hex payload
    /// is normalized to the declared size (zero-padded or truncated) when
    /// the configuration declares one.
    pub async fn write_assembly_by_alias(
        &self,
        session_id: &str,
        alias: &str,
        payload_hex: &str,
    ) -> Result<CipStatus> {
        let assembly = self.writable_assembly(alias)?;
        let mut payload = decode_hex_payload(payload_hex)?;
        if let Some(size) = assembly.size {
            payload.resize(size, 0);
        }
        self.write_assembly(session_id, assembly.class_id, assembly.instance_id, payload)
            .await
    }

    /// Patch one member inside an assembly: read the current buffer back,
    /// mutate the targeted bytes in a zero-filled working copy, write the
    /// whole buffer out.
    pub async fn write_assembly_member(
        &self,
        session_id: &str,
        alias: &str,
        member_name: &str,
        value_hex: &str,
    ) -> Result<CipStatus> {
        let assembly = self.writable_assembly(alias)?;
        let value = decode_hex_payload(value_hex)?;
        let current = match assembly.size {
            Some(size) => {
                self.read_assembly(session_id, assembly.class_id, assembly.instance_id, size)
                    .await?
                    .data
            }
            None => Vec::new(),
        };
        let buffer = apply_member_value(&assembly, &current, member_name, &value)?;
        self.write_assembly(session_id, assembly.class_id, assembly.instance_id, buffer)
            .await
    }

    /// Read an assembly by alias and decode its members per the configured
    /// layout.
    pub async fn get_assembly_runtime(
        &self,
        session_id: &str,
        alias: &str,
    ) -> Result<AssemblyRuntimeView> {
        let assembly = {
            let registry = self.registry();
            registry.lookup(alias)?.clone()
        };
        let size = assembly.size.ok_or_else(|| {
            EnipLinkError::config(format!(
                "assembly '{alias}' declares no size and cannot be read"
            ))
        })?;
        let result = self
            .read_assembly(session_id, assembly.class_id, assembly.instance_id, size)
            .await?;
        let members = decode_members(&assembly, &result.data);
        Ok(AssemblyRuntimeView {
            alias: assembly.alias,
            class_id: assembly.class_id,
            instance_id: assembly.instance_id,
            direction: assembly.direction,
            size: Some(size),
            payload_hex: result.data_hex,
            timestamp: result.timestamp,
            status: result.status,
            word_values: result.word_values,
            members,
        })
    }

    /// Generic CIP command dispatch with an explicit transport tag.
    pub async fn send_command(
        &self,
        session_id: &str,
        service_code: u8,
        path: CipPath,
        payload: Vec<u8>,
        transport: CommandTransport,
    ) -> Result<CommandResult> {
        let (status, payload) = match transport {
            CommandTransport::Rr => {
                self.dispatch_rr(session_id, service_code, path, payload, false)
                    .await?
            }
            CommandTransport::RrRouted => {
                self.dispatch_rr(session_id, service_code, path, payload, true)
                    .await?
            }
            CommandTransport::Unit => {
                self.dispatch_unit(session_id, service_code, path, payload)
                    .await?
            }
        };
        Ok(CommandResult { status, payload })
    }

    fn writable_assembly(&self, alias: &str) -> Result<Assembly> {
        let registry = self.registry();
        let assembly = registry.lookup(alias)?.clone();
        if !assembly.direction.accepts_writes() {
            return Err(EnipLinkError::config(format!(
                "assembly '{alias}' is not configured for output operations"
            )));
        }
        Ok(assembly)
    }
}

fn decode_hex_payload(payload_hex: &str) -> Result<Vec<u8>> {
    hex::decode(payload_hex.trim())
        .map_err(|err| EnipLinkError::config(format!("payload is not valid hex: {err}")))
}

/// Little-endian 16-bit words from a flat buffer; `None` when the buffer
/// length is odd or zero.
pub fn decode_words(buffer: &[u8]) -> Option<Vec<u16>> {
    if buffer.is_empty() || buffer.len() % 2 != 0 {
        return None;
    }
    Some(
        buffer
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    )
}

/// Slice the buffer per member layout.
///
/// A member lying past the end of the buffer is reported with an empty
/// `raw_hex` and no integer value rather than failing the whole decode.
/// The unsigned integer interpretation is produced for 1, 2 and 4-byte
/// members only.
pub fn decode_members(assembly: &Assembly, buffer: &[u8]) -> Vec<MemberValue> {
    assembly
        .members
        .iter()
        .map(|member| {
            let end = member.offset + member.size;
            let (raw_hex, int_value) = if end > buffer.len() {
                (String::new(), None)
            } else {
                let chunk = &buffer[member.offset..end];
                let int_value = match member.size {
                    1 => Some(chunk[0] as u64),
                    2 => Some(u16::from_le_bytes([chunk[0], chunk[1]]) as u64),
                    4 => Some(
                        u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u64,
                    ),
                    _ => None,
                };
                (hex::encode(chunk), int_value)
            };
            MemberValue {
                name: member.name.clone(),
                offset: member.offset,
                size: member.size,
                datatype: member.datatype.clone(),
                description: member.description.clone(),
                raw_hex,
                int_value,
            }
        })
        .collect()
}

/// Produce the buffer for a member-targeted write: zero-filled working
/// buffer sized to cover both the current payload and the member extent,
/// current bytes copied in, member bytes overwritten.
pub fn apply_member_value(
    assembly: &Assembly,
    current: &[u8],
    member_name: &str,
    value: &[u8],
) -> Result<Vec<u8>> {
    let member = assembly
        .members
        .iter()
        .find(|member| member.name == member_name)
        .ok_or_else(|| {
            EnipLinkError::config(format!(
                "assembly '{}' has no member '{member_name}'",
                assembly.alias
            ))
        })?;
    if value.len() != member.size {
        return Err(EnipLinkError::config(format!(
            "member '{member_name}' is {} bytes, got {}",
            member.size,
            value.len()
        )));
    }
    let required = member.offset + member.size;
    let mut buffer = vec![0u8; current.len().max(required)];
    buffer[..current.len()].copy_from_slice(current);
    buffer[member.offset..required].copy_from_slice(value);
    Ok(buffer)
}
