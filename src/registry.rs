// registry.rs - Device configuration parsing and assembly alias resolution
//
// The device description is an XML document with an identity element and an
// ordered list of assembly elements. The parser is tolerant about attribute
// spellings and unknown elements (ignored with a warning) but strict about
// the semantic invariants: aliases are globally unique and case-sensitive,
// members carry resolvable offsets and sizes, and declared member extents
// stay inside the declared assembly size.

use crate::epath::CipPath;
use crate::error::{EnipLinkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Attribute id of the Data attribute of a CIP Assembly object instance.
pub const ASSEMBLY_DATA_ATTRIBUTE: u16 = 3;

/// Default class id for assembly elements that omit one.
const ASSEMBLY_CLASS_DEFAULT: u16 = 0x04;

/// Direction of an assembly relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyDirection {
    Input,
    Output,
    Configuration,
    Bidirectional,
}

impl AssemblyDirection {
    fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "input" | "in" => Some(AssemblyDirection::Input),
            "output" | "out" => Some(AssemblyDirection::Output),
            "configuration" | "config" => Some(AssemblyDirection::Configuration),
            "bidirectional" | "inout" | "io" => Some(AssemblyDirection::Bidirectional),
            _ => None,
        }
    }

    /// Whether assembly writes are allowed in this direction.
    pub fn accepts_writes(&self) -> bool {
        matches!(
            self,
            AssemblyDirection::Output | AssemblyDirection::Bidirectional
        )
    }
}

/// Direction of one member within an assembly buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberDirection {
    In,
    Out,
    Both,
}

impl MemberDirection {
    fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "in" | "input" => Some(MemberDirection::In),
            "out" | "output" => Some(MemberDirection::Out),
            "both" | "inout" | "io" => Some(MemberDirection::Both),
            _ => None,
        }
    }
}

/// One named field inside a flat assembly byte buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyMember {
    pub name: String,
    /// Byte offset into the assembly buffer.
    pub offset: usize,
    /// Extent in bytes.
    pub size: usize,
    pub datatype: Option<String>,
    pub direction: Option<MemberDirection>,
    pub description: Option<String>,
}

/// One assembly declared in the device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assembly {
    pub alias: String,
    pub class_id: u16,
    pub instance_id: u16,
    pub direction: AssemblyDirection,
    pub size: Option<usize>,
    pub members: Vec<AssemblyMember>,
}

impl Assembly {
    /// CIP path for this assembly, optionally down to an attribute.
    pub fn path(&self, attribute_id: Option<u16>) -> CipPath {
        match attribute_id {
            Some(attr) => CipPath::make_attribute(self.class_id, self.instance_id, attr),
            None => CipPath::make(self.class_id, self.instance_id),
        }
    }

    /// Path to the Data attribute, the read/write target for assembly I/O.
    pub fn data_path(&self) -> CipPath {
        self.path(Some(ASSEMBLY_DATA_ATTRIBUTE))
    }
}

/// Identity metadata of the target device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: Option<String>,
    pub vendor: Option<String>,
    pub product_code: Option<String>,
    pub revision: Option<String>,
    pub serial_number: Option<String>,
}

/// Parsed device configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    pub identity: DeviceIdentity,
    pub assemblies: Vec<Assembly>,
}

impl DeviceConfiguration {
    /// Parse an XML payload into a validated configuration.
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|err| EnipLinkError::config(format!("malformed XML payload: {err}")))?;
        let root = doc.root_element();
        let root_key = normalize_key(root.tag_name().name());
        if !matches!(
            root_key.as_str(),
            "device" | "deviceconfiguration" | "plc" | "cip"
        ) {
            return Err(EnipLinkError::config(format!(
                "unsupported root element <{}>",
                root.tag_name().name()
            )));
        }

        let identity = root
            .children()
            .filter(roxmltree::Node::is_element)
            .find(|node| normalize_key(node.tag_name().name()) == "identity")
            .map(parse_identity)
            .unwrap_or_default();

        let mut assemblies = Vec::new();
        let mut seen_aliases: HashMap<String, ()> = HashMap::new();
        for node in root.descendants().filter(roxmltree::Node::is_element) {
            if normalize_key(node.tag_name().name()) != "assembly" {
                continue;
            }
            let assembly = parse_assembly(&node)?;
            // Aliases are case-sensitive: "Inputs" and "inputs" may coexist,
            // an exact repeat is rejected.
            if seen_aliases.insert(assembly.alias.clone(), ()).is_some() {
                return Err(EnipLinkError::config(format!(
                    "duplicate assembly alias '{}'",
                    assembly.alias
                )));
            }
            assemblies.push(assembly);
        }

        let config = Self {
            identity,
            assemblies,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for assembly in &self.assemblies {
            if let Some(size) = assembly.size {
                for member in &assembly.members {
                    if member.offset + member.size > size {
                        return Err(EnipLinkError::config(format!(
                            "member '{}' of assembly '{}' extends to byte {} past the declared size {}",
                            member.name,
                            assembly.alias,
                            member.offset + member.size,
                            size
                        )));
                    }
                }
            }
            // Overlapping members are legal (they may alias one logical
            // field) but worth a diagnostic. Nothing is dropped.
            for (i, a) in assembly.members.iter().enumerate() {
                for b in assembly.members.iter().skip(i + 1) {
                    if a.offset < b.offset + b.size && b.offset < a.offset + a.size {
                        warn!(
                            assembly = %assembly.alias,
                            first = %a.name,
                            second = %b.name,
                            "assembly members overlap"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_identity(node: roxmltree::Node) -> DeviceIdentity {
    let attrs = normalized_attributes(&node);
    let child_text = |names: &[&str]| -> Option<String> {
        node.children()
            .filter(roxmltree::Node::is_element)
            .find(|child| {
                let key = normalize_key(child.tag_name().name());
                names.iter().any(|name| key == *name)
            })
            .and_then(|child| child.text())
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    };
    DeviceIdentity {
        name: get_attr(&attrs, &["name", "productname"]).or_else(|| child_text(&["name", "productname"])),
        vendor: get_attr(&attrs, &["vendor", "vendorid", "vendorname"])
            .or_else(|| child_text(&["vendor", "vendorname"])),
        product_code: get_attr(&attrs, &["product", "productcode"])
            .or_else(|| child_text(&["product", "productcode"])),
        revision: get_attr(&attrs, &["revision"]).or_else(|| child_text(&["revision"])),
        serial_number: get_attr(&attrs, &["serial", "serialnumber"])
            .or_else(|| child_text(&["serialnumber", "serial"])),
    }
}

fn parse_assembly(node: &roxmltree::Node) -> Result<Assembly> {
    let attrs = normalized_attributes(node);
    let alias = get_attr(&attrs, &["alias", "id", "name"]).ok_or_else(|| {
        EnipLinkError::config(format!(
            "element <{}> is missing required attribute 'alias'",
            node.tag_name().name()
        ))
    })?;
    let class_id = match get_attr(&attrs, &["classid", "class"]) {
        Some(raw) => parse_u16(&raw, &alias, "class_id")?,
        None => ASSEMBLY_CLASS_DEFAULT,
    };
    let instance_id = match get_attr(&attrs, &["instanceid", "instance"]) {
        Some(raw) => parse_u16(&raw, &alias, "instance_id")?,
        None => {
            return Err(EnipLinkError::config(format!(
                "assembly '{alias}' is missing required instance identifier"
            )))
        }
    };
    let direction_raw = get_attr(&attrs, &["direction", "dir"]).ok_or_else(|| {
        EnipLinkError::config(format!("assembly '{alias}' is missing required direction"))
    })?;
    let direction = AssemblyDirection::parse(&direction_raw).ok_or_else(|| {
        EnipLinkError::config(format!(
            "assembly '{alias}' has unsupported direction '{direction_raw}'"
        ))
    })?;
    let size = match get_attr(&attrs, &["size", "length", "bytelength"]) {
        Some(raw) => Some(parse_usize(&raw, &alias, "size")?),
        None => None,
    };

    let mut members = Vec::new();
    for child in node.children().filter(roxmltree::Node::is_element) {
        match normalize_key(child.tag_name().name()).as_str() {
            "member" => members.push(parse_member(&child, &alias)?),
            "members" => {
                for grandchild in child.children().filter(roxmltree::Node::is_element) {
                    if normalize_key(grandchild.tag_name().name()) == "member" {
                        members.push(parse_member(&grandchild, &alias)?);
                    } else {
                        warn!(
                            assembly = %alias,
                            element = grandchild.tag_name().name(),
                            "ignoring unknown element in member list"
                        );
                    }
                }
            }
            "description" => {}
            other => {
                warn!(assembly = %alias, element = other, "ignoring unknown assembly element");
            }
        }
    }

    Ok(Assembly {
        alias,
        class_id,
        instance_id,
        direction,
        size,
        members,
    })
}

fn parse_member(node: &roxmltree::Node, alias: &str) -> Result<AssemblyMember> {
    let attrs = normalized_attributes(node);
    let name = get_attr(&attrs, &["name", "symbol", "symbolname", "id"]).ok_or_else(|| {
        EnipLinkError::config(format!(
            "a member of assembly '{alias}' is missing required attribute 'name'"
        ))
    })?;
    let datatype = get_attr(&attrs, &["datatype", "type"]);
    let offset = match get_attr(&attrs, &["offset", "byteoffset"]) {
        Some(raw) => parse_usize(&raw, alias, "offset")?,
        None => {
            return Err(EnipLinkError::config(format!(
                "member '{name}' of assembly '{alias}' is missing required offset"
            )))
        }
    };
    let size = match get_attr(&attrs, &["size", "length", "bytelength"]) {
        Some(raw) => parse_usize(&raw, alias, "size")?,
        None => match datatype.as_deref().and_then(scalar_type_size) {
            Some(size) => size,
            None => {
                return Err(EnipLinkError::config(format!(
                    "member '{name}' of assembly '{alias}' has no size and no sized datatype"
                )))
            }
        },
    };
    let direction = get_attr(&attrs, &["direction", "dir"])
        .as_deref()
        .and_then(MemberDirection::parse);
    let description = get_attr(&attrs, &["description", "comment"]).or_else(|| {
        node.text()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    });

    Ok(AssemblyMember {
        name,
        offset,
        size,
        datatype,
        direction,
        description,
    })
}

/// Byte size implied by a CIP scalar datatype name.
fn scalar_type_size(datatype: &str) -> Option<usize> {
    match normalize_key(datatype).as_str() {
        "bool" | "boolean" | "byte" | "sint" | "usint" => Some(1),
        "int" | "uint" | "word" => Some(2),
        "dint" | "udint" | "dword" | "real" => Some(4),
        "lint" | "ulint" | "lword" | "lreal" => Some(8),
        _ => None,
    }
}

fn normalize_key(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn normalized_attributes(node: &roxmltree::Node) -> HashMap<String, String> {
    node.attributes()
        .filter(|attr| !attr.value().trim().is_empty())
        .map(|attr| (normalize_key(attr.name()), attr.value().trim().to_string()))
        .collect()
}

fn get_attr(attrs: &HashMap<String, String>, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find_map(|candidate| attrs.get(*candidate).cloned())
}

fn parse_u16(raw: &str, alias: &str, field: &str) -> Result<u16> {
    let value = parse_integer(raw).ok_or_else(|| {
        EnipLinkError::config(format!("assembly '{alias}': invalid {field} '{raw}'"))
    })?;
    u16::try_from(value).map_err(|_| {
        EnipLinkError::config(format!("assembly '{alias}': {field} {value} out of range"))
    })
}

fn parse_usize(raw: &str, alias: &str, field: &str) -> Result<usize> {
    let value = parse_integer(raw).ok_or_else(|| {
        EnipLinkError::config(format!("assembly '{alias}': invalid {field} '{raw}'"))
    })?;
    usize::try_from(value).map_err(|_| {
        EnipLinkError::config(format!("assembly '{alias}': {field} {value} out of range"))
    })
}

/// Integer literal, decimal or 0x-prefixed hexadecimal.
fn parse_integer(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else {
        trimmed.parse::<u64>().ok()
    }
}

/// Resolves case-sensitive assembly aliases to their declarations.
#[derive(Debug, Default)]
pub struct AssemblyRegistry {
    assemblies: Vec<Assembly>,
    index: HashMap<String, usize>,
}

impl AssemblyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configuration(config: &DeviceConfiguration) -> Result<Self> {
        let mut registry = Self::new();
        for assembly in &config.assemblies {
            if registry.index.contains_key(&assembly.alias) {
                return Err(EnipLinkError::config(format!(
                    "duplicate assembly alias '{}'",
                    assembly.alias
                )));
            }
            registry
                .index
                .insert(assembly.alias.clone(), registry.assemblies.len());
            registry.assemblies.push(assembly.clone());
        }
        Ok(registry)
    }

    pub fn lookup(&self, alias: &str) -> Result<&Assembly> {
        self.index
            .get(alias)
            .map(|idx| &self.assemblies[*idx])
            .ok_or_else(|| EnipLinkError::UnknownAlias(alias.to_string()))
    }

    /// Resolve an alias to the write target `(class, instance, attribute)`.
    /// Attribute 3 is the Data attribute of an Assembly object by
    /// convention.
    pub fn write_target(&self, alias: &str) -> Result<(u16, u16, u16)> {
        let assembly = self.lookup(alias)?;
        Ok((
            assembly.class_id,
            assembly.instance_id,
            ASSEMBLY_DATA_ATTRIBUTE,
        ))
    }

    pub fn path_for(&self, alias: &str, attribute_id: Option<u16>) -> Result<CipPath> {
        Ok(self.lookup(alias)?.path(attribute_id))
    }

    pub fn assemblies(&self) -> &[Assembly] {
        &self.assemblies
    }

    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    configuration: Option<DeviceConfiguration>,
    registry: Arc<AssemblyRegistry>,
    raw_xml: Option<String>,
}

/// Shared holder of the loaded device configuration.
///
/// Lock-ordering note: code that needs both this store and the session or
/// pool tables must take this lock first.
#[derive(Debug, Default)]
pub struct ConfigStore {
    state: RwLock<StoreState>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse, validate and install a new configuration document.
    /// A rejected document leaves the previous one in place.
    pub fn load(&self, xml: &str) -> Result<DeviceConfiguration> {
        let configuration = DeviceConfiguration::parse(xml)?;
        let registry = Arc::new(AssemblyRegistry::from_configuration(&configuration)?);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.configuration = Some(configuration.clone());
        state.registry = registry;
        state.raw_xml = Some(xml.to_string());
        Ok(configuration)
    }

    pub fn registry(&self) -> Arc<AssemblyRegistry> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&state.registry)
    }

    pub fn configuration(&self) -> Option<DeviceConfiguration> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.configuration.clone()
    }

    pub fn configuration_xml(&self) -> Option<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.raw_xml.clone()
    }

    pub fn is_loaded(&self) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.configuration.is_some()
    }

    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = StoreState::default();
    }
}
