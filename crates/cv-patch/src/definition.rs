//! Patch definition model

use cv_core::title::{Serial, TitleVersion};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Operation kinds understood by the applier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    /// Single byte
    Byte,
    /// Byte sequence
    Bytes,
    /// Little-endian 16-bit word
    U16,
    /// Little-endian 32-bit word
    U32,
    /// Little-endian 64-bit word
    U64,
    /// UTF-8 text, written without terminator
    Utf8,
    /// Recorded but writes nothing
    Skip,
}

/// Payload length a kind accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeastOne,
    None,
}

impl Arity {
    pub fn accepts(&self, len: usize) -> bool {
        match self {
            Arity::Exactly(n) => len == *n,
            Arity::AtLeastOne => len >= 1,
            Arity::None => len == 0,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(n) => write!(f, "exactly {} bytes", n),
            Arity::AtLeastOne => write!(f, "at least 1 byte"),
            Arity::None => write!(f, "no payload"),
        }
    }
}

impl PatchOpKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "byte" => Some(PatchOpKind::Byte),
            "bytes" => Some(PatchOpKind::Bytes),
            "u16" => Some(PatchOpKind::U16),
            "u32" => Some(PatchOpKind::U32),
            "u64" => Some(PatchOpKind::U64),
            "utf8" => Some(PatchOpKind::Utf8),
            "skip" => Some(PatchOpKind::Skip),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PatchOpKind::Byte => "byte",
            PatchOpKind::Bytes => "bytes",
            PatchOpKind::U16 => "u16",
            PatchOpKind::U32 => "u32",
            PatchOpKind::U64 => "u64",
            PatchOpKind::Utf8 => "utf8",
            PatchOpKind::Skip => "skip",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            PatchOpKind::Byte => Arity::Exactly(1),
            PatchOpKind::U16 => Arity::Exactly(2),
            PatchOpKind::U32 => Arity::Exactly(4),
            PatchOpKind::U64 => Arity::Exactly(8),
            PatchOpKind::Bytes | PatchOpKind::Utf8 => Arity::AtLeastOne,
            PatchOpKind::Skip => Arity::None,
        }
    }

    /// Word width for numeric kinds
    pub fn word_size(&self) -> Option<usize> {
        match self {
            PatchOpKind::U16 => Some(2),
            PatchOpKind::U32 => Some(4),
            PatchOpKind::U64 => Some(8),
            _ => None,
        }
    }
}

impl fmt::Display for PatchOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One write (or placeholder) at an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOp {
    pub address: u64,
    pub kind: PatchOpKind,
    #[serde(with = "hex_bytes", default)]
    pub payload: Vec<u8>,
}

impl PatchOp {
    pub fn new(address: u64, kind: PatchOpKind, payload: Vec<u8>) -> Self {
        Self {
            address,
            kind,
            payload,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.kind.arity().accepts(self.payload.len())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// Title versions a definition applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionReq {
    Exact(TitleVersion),
    /// Inclusive on both ends
    Range { min: TitleVersion, max: TitleVersion },
}

impl VersionReq {
    /// Parse `1.05` or `1.00-1.05`
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        match text.split_once('-') {
            Some((min, max)) => {
                let min = TitleVersion::parse(min.trim())?;
                let max = TitleVersion::parse(max.trim())?;
                if min > max {
                    return None;
                }
                Some(VersionReq::Range { min, max })
            }
            None => TitleVersion::parse(text).map(VersionReq::Exact),
        }
    }

    pub fn matches(&self, version: &TitleVersion) -> bool {
        match self {
            VersionReq::Exact(v) => v == version,
            VersionReq::Range { min, max } => min <= version && version <= max,
        }
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionReq::Exact(v) => write!(f, "{}", v),
            VersionReq::Range { min, max } => write!(f, "{}-{}", min, max),
        }
    }
}

impl Serialize for VersionReq {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionReq {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid version requirement: {:?}", text)))
    }
}

/// A named set of byte-level modifications for one title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub author: String,
    pub serial: Serial,
    pub version: VersionReq,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub ops: Vec<PatchOp>,
}

impl PatchDefinition {
    pub fn targets(&self, serial: &Serial, version: &TitleVersion) -> bool {
        &self.serial == serial && self.version.matches(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> TitleVersion {
        TitleVersion::parse(s).unwrap()
    }

    #[test]
    fn test_version_req() {
        let exact = VersionReq::parse("1.05").unwrap();
        assert!(exact.matches(&v("01.05")));
        assert!(!exact.matches(&v("1.06")));

        let range = VersionReq::parse("1.00-1.05").unwrap();
        assert!(range.matches(&v("1.00")));
        assert!(range.matches(&v("1.02")));
        assert!(range.matches(&v("1.05")));
        assert!(!range.matches(&v("1.10")));
        assert_eq!(range.to_string(), "1.00-1.05");

        assert!(VersionReq::parse("1.05-1.00").is_none());
        assert!(VersionReq::parse("latest").is_none());
    }

    #[test]
    fn test_op_kind_arity() {
        assert!(PatchOpKind::Byte.arity().accepts(1));
        assert!(!PatchOpKind::Byte.arity().accepts(2));
        assert!(PatchOpKind::Bytes.arity().accepts(3));
        assert!(!PatchOpKind::Bytes.arity().accepts(0));
        assert!(PatchOpKind::Skip.arity().accepts(0));
        assert_eq!(PatchOpKind::U32.word_size(), Some(4));
        assert_eq!(PatchOpKind::from_name("UTF8"), Some(PatchOpKind::Utf8));
        assert_eq!(PatchOpKind::from_name("float"), None);
    }

    #[test]
    fn test_definition_json_roundtrip() {
        let def = PatchDefinition {
            id: "fps60".to_string(),
            name: "60 FPS".to_string(),
            author: "someone".to_string(),
            serial: Serial::parse("CUSA00001").unwrap(),
            version: VersionReq::parse("1.00-1.05").unwrap(),
            note: None,
            ops: vec![PatchOp::new(0x1000, PatchOpKind::Bytes, vec![0xDE, 0xAD])],
        };
        let json = serde_json::to_string(&def).unwrap();
        assert!(json.contains("\"payload\":\"DEAD\""));
        assert!(json.contains("\"version\":\"1.00-1.05\""));
        let back: PatchDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
    }
}
