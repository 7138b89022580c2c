// status.rs - CIP response status codes and message lookup

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Status of a CIP reply.
///
/// `general == 0` is success. Any other value is a protocol-level error
/// reported by the device; it is carried back to callers as a value and
/// never invalidates the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CipStatus {
    /// General status code from the CIP reply header.
    pub general: u8,
    /// First extended status word, when the reply carried one.
    pub extended: Option<u16>,
}

impl CipStatus {
    pub const SUCCESS: CipStatus = CipStatus {
        general: 0,
        extended: None,
    };

    pub fn new(general: u8, extended: Option<u16>) -> Self {
        Self { general, extended }
    }

    pub fn from_general(general: u8) -> Self {
        Self {
            general,
            extended: None,
        }
    }

    /// True when the device reported success.
    pub fn is_ok(&self) -> bool {
        self.general == 0
    }

    /// Human-readable description of the general status code.
    pub fn message(&self) -> &'static str {
        GENERAL_STATUS_MESSAGES
            .get(&self.general)
            .copied()
            .unwrap_or("Reserved by CIP")
    }
}

impl fmt::Display for CipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.extended {
            Some(ext) => write!(
                f,
                "0x{:02X} ({}, extended 0x{:04X})",
                self.general,
                self.message(),
                ext
            ),
            None => write!(f, "0x{:02X} ({})", self.general, self.message()),
        }
    }
}

lazy_static! {
    /// General status code descriptions from the CIP specification, volume 1
    /// appendix B. Codes missing from the table are reserved.
    static ref GENERAL_STATUS_MESSAGES: HashMap<u8, &'static str> = {
        let mut m = HashMap::new();
        m.insert(0x00, "Success");
        m.insert(0x01, "Connection failure");
        m.insert(0x02, "Resource unavailable");
        m.insert(0x03, "Invalid parameter value");
        m.insert(0x04, "Path segment error");
        m.insert(0x05, "Path destination unknown");
        m.insert(0x06, "Partial transfer");
        m.insert(0x07, "Connection lost");
        m.insert(0x08, "Service not supported");
        m.insert(0x09, "Invalid attribute value");
        m.insert(0x0A, "Attribute list error");
        m.insert(0x0B, "Already in requested mode/state");
        m.insert(0x0C, "Object state conflict");
        m.insert(0x0D, "Object already exists");
        m.insert(0x0E, "Attribute not settable");
        m.insert(0x0F, "Privilege violation");
        m.insert(0x10, "Device state conflict");
        m.insert(0x11, "Reply data too large");
        m.insert(0x12, "Fragmentation of a primitive value");
        m.insert(0x13, "Not enough data");
        m.insert(0x14, "Attribute not supported");
        m.insert(0x15, "Too much data");
        m.insert(0x16, "Object does not exist");
        m.insert(0x17, "Service fragmentation sequence not in progress");
        m.insert(0x18, "No stored attribute data");
        m.insert(0x19, "Store operation failure");
        m.insert(0x1A, "Routing failure, request packet too large");
        m.insert(0x1B, "Routing failure, response packet too large");
        m.insert(0x1C, "Missing attribute list entry data");
        m.insert(0x1D, "Invalid attribute value list");
        m.insert(0x1E, "Embedded service error");
        m.insert(0x1F, "Vendor specific error");
        m.insert(0x20, "Invalid parameter");
        m.insert(0x25, "Key failure in path");
        m.insert(0x26, "Path size invalid");
        m.insert(0x27, "Unexpected attribute in list");
        m.insert(0x28, "Invalid member ID");
        m.insert(0x29, "Member not settable");
        m
    };
}
