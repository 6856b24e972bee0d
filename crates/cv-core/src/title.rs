//! Title identity shared by the installer and the patch engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Length of a title serial, e.g. "CUSA00001"
pub const SERIAL_LEN: usize = 9;

/// Stable title identifier, independent of version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Serial(String);

impl Serial {
    /// Parse a serial: four uppercase ASCII letters followed by five digits
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if Self::is_valid(value) {
            Some(Self(value.to_string()))
        } else {
            None
        }
    }

    /// Check a serial string without allocating
    pub fn is_valid(value: &str) -> bool {
        let bytes = value.as_bytes();
        bytes.len() == SERIAL_LEN
            && bytes[..4].iter().all(u8::is_ascii_uppercase)
            && bytes[4..].iter().all(u8::is_ascii_digit)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Serial {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid serial: {:?}", value))
    }
}

impl From<Serial> for String {
    fn from(serial: Serial) -> Self {
        serial.0
    }
}

impl FromStr for Serial {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

/// Dotted numeric title version ("1.05", "01.05", "10")
///
/// Components compare numerically; missing trailing components count as zero,
/// so "01.05" == "1.05" and "1.10" > "1.9". The original text is kept for display.
#[derive(Debug, Clone)]
pub struct TitleVersion {
    text: String,
    components: Vec<u32>,
}

impl TitleVersion {
    /// Parse a version string, `None` if any component is not a number
    pub fn parse(value: &str) -> Option<Self> {
        let text = value.trim();
        if text.is_empty() {
            return None;
        }

        let components = text
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    None
                } else {
                    part.parse::<u32>().ok()
                }
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            text: text.to_string(),
            components,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn components(&self) -> &[u32] {
        &self.components
    }

    fn component(&self, index: usize) -> u32 {
        self.components.get(index).copied().unwrap_or(0)
    }
}

impl PartialEq for TitleVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TitleVersion {}

impl PartialOrd for TitleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TitleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl fmt::Display for TitleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for TitleVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid version: {:?}", s))
    }
}

impl Serialize for TitleVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for TitleVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid version: {:?}", text)))
    }
}

/// Package / installed content category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Base game
    Base,
    /// Title update
    Update,
    /// Downloadable add-on content
    Dlc,
    /// Save data bundle
    SaveData,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Base => "base",
            Category::Update => "update",
            Category::Dlc => "dlc",
            Category::SaveData => "savedata",
        }
    }

    /// Wire tag used in the package header
    pub fn tag(&self) -> u16 {
        match self {
            Category::Base => 1,
            Category::Update => 2,
            Category::Dlc => 3,
            Category::SaveData => 4,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(Category::Base),
            2 => Some(Category::Update),
            3 => Some(Category::Dlc),
            4 => Some(Category::SaveData),
            _ => None,
        }
    }

    /// Categories whose versions are compared on reinstall
    pub fn is_versioned(&self) -> bool {
        matches!(self, Category::Base | Category::Update | Category::SaveData)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "base" | "game" => Ok(Category::Base),
            "update" | "patch" => Ok(Category::Update),
            "dlc" | "addcont" => Ok(Category::Dlc),
            "savedata" | "save" => Ok(Category::SaveData),
            other => Err(format!("unknown category: {}", other)),
        }
    }
}

/// Identity of one installed unit: (serial, category) plus the DLC sub-identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TitleKey {
    pub serial: Serial,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dlc_id: Option<String>,
}

impl TitleKey {
    pub fn new(serial: Serial, category: Category, dlc_id: Option<String>) -> Self {
        // Only DLC units are told apart by sub-identifier
        let dlc_id = if category == Category::Dlc { dlc_id } else { None };
        Self {
            serial,
            category,
            dlc_id,
        }
    }
}

impl fmt::Display for TitleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dlc_id {
            Some(id) => write!(f, "{}/{}/{}", self.serial, self.category, id),
            None => write!(f, "{}/{}", self.serial, self.category),
        }
    }
}

/// A title (or update, DLC unit, save bundle) recorded in the content catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledTitle {
    pub serial: Serial,
    pub category: Category,
    pub version: TitleVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dlc_id: Option<String>,
    pub install_path: PathBuf,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub entry_count: u32,
    #[serde(default)]
    pub size: u64,
}

impl InstalledTitle {
    pub fn key(&self) -> TitleKey {
        TitleKey::new(self.serial.clone(), self.category, self.dlc_id.clone())
    }
}
