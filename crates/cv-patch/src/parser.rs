//! Patch document parser
//!
//! Parsing runs in two passes. The markup pass walks the quick-xml event
//! stream and collects raw `<Patch>` entries; any markup error there
//! discards the whole document. The validation pass then turns each raw
//! entry into a [`PatchDefinition`] or a single [`ParseWarning`], so one bad
//! entry never affects its siblings.

use crate::definition::{PatchDefinition, PatchOp, PatchOpKind, VersionReq};
use cv_core::title::Serial;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{HashMap, HashSet};
use std::fmt;

const ROOT_ELEMENT: &str = "PatchRepository";
const PATCH_ELEMENT: &str = "Patch";
const OP_ELEMENT: &str = "Op";
const NOTE_ELEMENT: &str = "Note";

/// Why an entry (or the document) was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseWarningKind {
    /// Markup is not well-formed or has the wrong root
    Document,
    MissingAttribute,
    InvalidSerial,
    InvalidVersion,
    InvalidAddress,
    InvalidPayload,
    ArityMismatch,
    /// Op kind from a newer document format
    UnsupportedOpKind,
    DuplicateId,
    EmptyOps,
    /// Unknown element; ignored, the entry is kept
    UnexpectedElement,
}

/// Non-fatal parse problem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub kind: ParseWarningKind,
    /// Zero-based `<Patch>` index, `None` for document-level warnings
    pub entry: Option<usize>,
    pub id: Option<String>,
    pub message: String,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.entry, &self.id) {
            (Some(entry), Some(id)) => write!(f, "patch #{} ({}): {}", entry, id, self.message),
            (Some(entry), None) => write!(f, "patch #{}: {}", entry, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Parsed definitions plus everything that was skipped
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    /// `name` attribute of the repository root
    pub repository: Option<String>,
    pub definitions: Vec<PatchDefinition>,
    pub warnings: Vec<ParseWarning>,
}

impl ParseOutcome {
    fn document_failure(message: String) -> Self {
        Self {
            repository: None,
            definitions: Vec::new(),
            warnings: vec![ParseWarning {
                kind: ParseWarningKind::Document,
                entry: None,
                id: None,
                message,
            }],
        }
    }
}

#[derive(Debug, Default)]
struct RawPatch {
    attrs: HashMap<String, String>,
    note: Option<String>,
    ops: Vec<HashMap<String, String>>,
    unexpected: Vec<String>,
}

#[derive(Debug, Default)]
struct RawDocument {
    repository: Option<String>,
    patches: Vec<RawPatch>,
    unexpected: Vec<String>,
}

/// Parse a patch document
pub fn parse(text: &str) -> ParseOutcome {
    let raw = match read_markup(text) {
        Ok(raw) => raw,
        Err(message) => {
            tracing::warn!("Failed to parse patch document: {}", message);
            return ParseOutcome::document_failure(message);
        }
    };

    let mut outcome = ParseOutcome {
        repository: raw.repository,
        ..ParseOutcome::default()
    };

    for name in raw.unexpected {
        outcome.warnings.push(ParseWarning {
            kind: ParseWarningKind::UnexpectedElement,
            entry: None,
            id: None,
            message: format!("ignored element <{}>", name),
        });
    }

    let mut seen_ids = HashSet::new();
    for (index, patch) in raw.patches.into_iter().enumerate() {
        let id = patch.attrs.get("id").cloned().filter(|id| !id.trim().is_empty());

        for name in &patch.unexpected {
            outcome.warnings.push(ParseWarning {
                kind: ParseWarningKind::UnexpectedElement,
                entry: Some(index),
                id: id.clone(),
                message: format!("ignored element <{}>", name),
            });
        }

        let result = build_definition(patch).and_then(|definition| {
            if seen_ids.insert(definition.id.clone()) {
                Ok(definition)
            } else {
                Err((
                    ParseWarningKind::DuplicateId,
                    format!("duplicate patch id {:?}", definition.id),
                ))
            }
        });

        match result {
            Ok(definition) => outcome.definitions.push(definition),
            Err((kind, message)) => {
                tracing::debug!("Skipping patch #{}: {}", index, message);
                outcome.warnings.push(ParseWarning {
                    kind,
                    entry: Some(index),
                    id,
                    message,
                });
            }
        }
    }

    tracing::info!(
        "Parsed patch document {}: {} definitions, {} warnings",
        outcome.repository.as_deref().unwrap_or("<unnamed>"),
        outcome.definitions.len(),
        outcome.warnings.len()
    );
    outcome
}

fn read_attrs(element: &BytesStart<'_>) -> Result<HashMap<String, String>, String> {
    let mut attrs = HashMap::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| format!("malformed attribute: {}", e))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| format!("malformed attribute {}: {}", key, e))?;
        attrs.insert(key, value.into_owned());
    }
    Ok(attrs)
}

fn element_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.name().as_ref()).into_owned()
}

/// Markup pass: checks well-formedness and collects raw entries
fn read_markup(text: &str) -> Result<RawDocument, String> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut doc = RawDocument::default();
    let mut stack: Vec<String> = Vec::new();
    let mut saw_root = false;
    // Text is only collected while inside <Note>
    let mut note_text: Option<String> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("XML error at byte {}: {}", reader.error_position(), e))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                let name = element_name(e);

                match stack.len() {
                    0 => {
                        if saw_root {
                            return Err(format!("second root element <{}>", name));
                        }
                        if name != ROOT_ELEMENT {
                            return Err(format!(
                                "root element is <{}>, expected <{}>",
                                name, ROOT_ELEMENT
                            ));
                        }
                        saw_root = true;
                        doc.repository = read_attrs(e)?.remove("name");
                    }
                    1 if name == PATCH_ELEMENT => {
                        doc.patches.push(RawPatch {
                            attrs: read_attrs(e)?,
                            ..RawPatch::default()
                        });
                    }
                    1 => doc.unexpected.push(name.clone()),
                    2 => {
                        // Depth 2 only exists under <Patch> or an ignored element
                        let in_patch = stack.get(1).is_some_and(|n| n == PATCH_ELEMENT);
                        if let (true, Some(patch)) = (in_patch, doc.patches.last_mut()) {
                            match name.as_str() {
                                OP_ELEMENT => patch.ops.push(read_attrs(e)?),
                                NOTE_ELEMENT if !empty => note_text = Some(String::new()),
                                NOTE_ELEMENT => {}
                                _ => patch.unexpected.push(name.clone()),
                            }
                        }
                    }
                    _ => {
                        // Validate attribute syntax even where the content is ignored
                        read_attrs(e)?;
                    }
                }

                if !empty {
                    stack.push(name);
                }
            }
            Event::End(ref e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match stack.pop() {
                    Some(open) if open == name => {}
                    Some(open) => {
                        return Err(format!("</{}> closes <{}>", name, open));
                    }
                    None => return Err(format!("unmatched </{}>", name)),
                }
                if name == NOTE_ELEMENT && stack.len() == 2 {
                    if let (Some(note), Some(patch)) = (note_text.take(), doc.patches.last_mut()) {
                        patch.note = Some(note.trim().to_string()).filter(|n| !n.is_empty());
                    }
                }
            }
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .map_err(|err| format!("malformed text: {}", err))?;
                if let Some(note) = note_text.as_mut() {
                    note.push_str(&text);
                }
            }
            Event::CData(e) => {
                if let Some(note) = note_text.as_mut() {
                    note.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(format!("unclosed element <{}>", open));
    }
    if !saw_root {
        return Err(format!("missing <{}> root element", ROOT_ELEMENT));
    }
    Ok(doc)
}

type EntryError = (ParseWarningKind, String);

/// Validation pass for one entry
fn build_definition(raw: RawPatch) -> Result<PatchDefinition, EntryError> {
    let mut attrs = raw.attrs;
    let mut required = |key: &str| -> Result<String, EntryError> {
        attrs
            .remove(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                (
                    ParseWarningKind::MissingAttribute,
                    format!("missing {} attribute", key),
                )
            })
    };

    let id = required("id")?;
    let serial_text = required("serial")?;
    let version_text = required("version")?;

    let serial = Serial::parse(&serial_text).ok_or_else(|| {
        (
            ParseWarningKind::InvalidSerial,
            format!("invalid serial {:?}", serial_text),
        )
    })?;
    let version = VersionReq::parse(&version_text).ok_or_else(|| {
        (
            ParseWarningKind::InvalidVersion,
            format!("invalid version {:?}", version_text),
        )
    })?;

    let name = attrs
        .remove("name")
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| id.clone());
    let author = attrs.remove("author").unwrap_or_default();

    if raw.ops.is_empty() {
        return Err((ParseWarningKind::EmptyOps, "patch has no operations".to_string()));
    }

    let ops = raw
        .ops
        .into_iter()
        .enumerate()
        .map(|(index, op)| {
            build_op(op).map_err(|(kind, message)| (kind, format!("op #{}: {}", index, message)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PatchDefinition {
        id,
        name,
        author: author.trim().to_string(),
        serial,
        version,
        note: raw.note,
        ops,
    })
}

fn build_op(mut attrs: HashMap<String, String>) -> Result<PatchOp, EntryError> {
    let kind_text = attrs.remove("kind").ok_or_else(|| {
        (
            ParseWarningKind::MissingAttribute,
            "missing kind attribute".to_string(),
        )
    })?;
    let kind = PatchOpKind::from_name(&kind_text).ok_or_else(|| {
        (
            ParseWarningKind::UnsupportedOpKind,
            format!("unsupported op kind {:?}", kind_text),
        )
    })?;

    let address_text = attrs.remove("address").ok_or_else(|| {
        (
            ParseWarningKind::MissingAttribute,
            "missing address attribute".to_string(),
        )
    })?;
    let address = parse_number(&address_text).ok_or_else(|| {
        (
            ParseWarningKind::InvalidAddress,
            format!("invalid address {:?}", address_text),
        )
    })?;

    let payload = match kind {
        PatchOpKind::Byte | PatchOpKind::Bytes => {
            let text = attrs.remove("payload").ok_or_else(|| {
                (
                    ParseWarningKind::MissingAttribute,
                    "missing payload attribute".to_string(),
                )
            })?;
            parse_hex_payload(&text)?
        }
        PatchOpKind::U16 | PatchOpKind::U32 | PatchOpKind::U64 => {
            let width = kind.word_size().unwrap_or(8);
            match (attrs.remove("value"), attrs.remove("payload")) {
                (Some(value), _) => {
                    let number = parse_number(&value).ok_or_else(|| {
                        (
                            ParseWarningKind::InvalidPayload,
                            format!("invalid {} value {:?}", kind, value),
                        )
                    })?;
                    if width < 8 && number >> (width * 8) != 0 {
                        return Err((
                            ParseWarningKind::ArityMismatch,
                            format!("value {:?} does not fit in {}", value, kind),
                        ));
                    }
                    number.to_le_bytes()[..width].to_vec()
                }
                (None, Some(payload)) => parse_hex_payload(&payload)?,
                (None, None) => {
                    return Err((
                        ParseWarningKind::MissingAttribute,
                        "missing value attribute".to_string(),
                    ))
                }
            }
        }
        PatchOpKind::Utf8 => attrs
            .remove("value")
            .ok_or_else(|| {
                (
                    ParseWarningKind::MissingAttribute,
                    "missing value attribute".to_string(),
                )
            })?
            .into_bytes(),
        PatchOpKind::Skip => match attrs.remove("payload") {
            Some(payload) => parse_hex_payload(&payload)?,
            None => Vec::new(),
        },
    };

    let op = PatchOp::new(address, kind, payload);
    if !op.is_valid() {
        return Err((
            ParseWarningKind::ArityMismatch,
            format!(
                "{} op expects {}, got {} bytes",
                kind,
                kind.arity(),
                op.payload.len()
            ),
        ));
    }
    Ok(op)
}

/// `0x`-prefixed hex or decimal
fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16).ok(),
        None => text.replace('_', "").parse().ok(),
    }
}

/// Hex bytes, whitespace between bytes allowed
fn parse_hex_payload(text: &str) -> Result<Vec<u8>, EntryError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact
        .strip_prefix("0x")
        .or_else(|| compact.strip_prefix("0X"))
        .unwrap_or(&compact);
    hex::decode(compact).map_err(|e| {
        (
            ParseWarningKind::InvalidPayload,
            format!("invalid hex payload {:?}: {}", text, e),
        )
    })
}
