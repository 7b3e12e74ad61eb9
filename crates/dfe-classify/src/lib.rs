//! Turns raw distribution entries into classified documents.
//!
//! Two steps, each failing only the entry at hand:
//! 1. [`decode`] reverses the base64 + gzip framing.
//! 2. [`classify`] reads the XML root to decide summary / full / event and
//!    pulls out the 44-digit access key.
//!
//! Neither step knows about accounts, watermarks or storage.

mod codec;

pub use codec::{decode, encode, DecodeError, MAX_DOC_BYTES};

use std::fmt;

use dfe_schemas::{
    AccessKey, ClassifiedDocument, DocumentEnvelope, DocumentFamily, DocumentKind, EventRef, Nsu,
    ParseError,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    NotUtf8,
    Xml(String),
    NoRoot,
    UnknownRoot(String),
    MissingAccessKey { root: String },
    AccessKey(ParseError),
    UnknownModel(String),
    MissingEventType { root: String },
    InvalidEventSequence(String),
}

impl fmt::Display for ClassifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifyError::NotUtf8 => write!(f, "document is not UTF-8"),
            ClassifyError::Xml(e) => write!(f, "malformed XML: {e}"),
            ClassifyError::NoRoot => write!(f, "document has no root element"),
            ClassifyError::UnknownRoot(r) => write!(f, "unrecognized root element '{r}'"),
            ClassifyError::MissingAccessKey { root } => {
                write!(f, "no access key found in '{root}'")
            }
            ClassifyError::AccessKey(e) => write!(f, "invalid access key: {e}"),
            ClassifyError::UnknownModel(m) => write!(f, "access key has unknown model '{m}'"),
            ClassifyError::MissingEventType { root } => {
                write!(f, "event document '{root}' has no tpEvento")
            }
            ClassifyError::InvalidEventSequence(v) => {
                write!(f, "nSeqEvento '{v}' is not a sequence number")
            }
        }
    }
}

impl std::error::Error for ClassifyError {}

/// Why one distribution entry was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryError {
    Decode(DecodeError),
    Classify(ClassifyError),
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryError::Decode(e) => write!(f, "decode: {e}"),
            EntryError::Classify(e) => write!(f, "classify: {e}"),
        }
    }
}

impl std::error::Error for EntryError {}

// ---------------------------------------------------------------------------
// Root element table
// ---------------------------------------------------------------------------

/// Kind by root local name. Anything not listed is rejected.
pub fn kind_for_root(root: &str) -> Option<DocumentKind> {
    match root {
        "resNFe" | "resCTe" => Some(DocumentKind::Summary),
        "nfeProc" | "NFe" | "cteProc" | "CTe" | "cteOSProc" | "CTeOS" => Some(DocumentKind::Full),
        "resEvento" | "procEventoNFe" | "procEventoCTe" | "eventoCTe" => Some(DocumentKind::Event),
        _ => None,
    }
}

/// `resNFe_v1.01` -> `1.01`.
pub fn schema_version(hint: &str) -> Option<String> {
    hint.rsplit_once("_v")
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// What [`classify`] learns from one XML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: DocumentKind,
    pub access_key: AccessKey,
    pub family: DocumentFamily,
    /// `versao` attribute of the root, when present.
    pub schema_version: Option<String>,
    pub root: String,
    pub event: Option<EventRef>,
}

/// Values collected in one pass over the document. First occurrence wins.
#[derive(Default)]
struct Scan {
    root: Option<String>,
    root_version: Option<String>,
    key_text: Option<String>,
    key_attr: Option<String>,
    event_code: Option<String>,
    event_seq: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Capture {
    None,
    KeyText,
    EventCode,
    EventSeq,
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.trim().to_string()))
}

fn scan(xml: &str) -> Result<Scan, ClassifyError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut s = Scan::default();
    let mut capture = Capture::None;

    loop {
        let ev = reader
            .read_event()
            .map_err(|e| ClassifyError::Xml(e.to_string()))?;
        match ev {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let local = e.local_name();
                let name = local.as_ref();
                if s.root.is_none() {
                    s.root = Some(String::from_utf8_lossy(name).into_owned());
                    s.root_version = attr(e, b"versao");
                }
                match name {
                    b"infNFe" | b"infCte" if s.key_attr.is_none() => {
                        s.key_attr = attr(e, b"Id");
                    }
                    _ => {}
                }
                capture = if matches!(ev, Event::Empty(_)) {
                    Capture::None
                } else {
                    match name {
                        b"chNFe" | b"chCTe" if s.key_text.is_none() => Capture::KeyText,
                        b"tpEvento" if s.event_code.is_none() => Capture::EventCode,
                        b"nSeqEvento" if s.event_seq.is_none() => Capture::EventSeq,
                        _ => Capture::None,
                    }
                };
            }
            Event::Text(t) => {
                if capture != Capture::None {
                    let v = t
                        .unescape()
                        .map_err(|e| ClassifyError::Xml(e.to_string()))?
                        .trim()
                        .to_string();
                    match capture {
                        Capture::KeyText => s.key_text = Some(v),
                        Capture::EventCode => s.event_code = Some(v),
                        Capture::EventSeq => s.event_seq = Some(v),
                        Capture::None => {}
                    }
                }
            }
            Event::End(_) => capture = Capture::None,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(s)
}

/// `NFe52060433...` / `CTe35...`: strip the literal prefix and keep the
/// trailing 44 characters.
fn key_from_id(id: &str) -> &str {
    let body = id
        .strip_prefix("NFe")
        .or_else(|| id.strip_prefix("CTe"))
        .unwrap_or(id);
    let n = body.chars().count();
    if n > AccessKey::LEN {
        let skip = body
            .char_indices()
            .nth(n - AccessKey::LEN)
            .map(|(i, _)| i)
            .unwrap_or(0);
        &body[skip..]
    } else {
        body
    }
}

/// Classify a decoded document.
pub fn classify(bytes: &[u8]) -> Result<Classification, ClassifyError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ClassifyError::NotUtf8)?;
    let text = text.trim_start_matches('\u{feff}');

    let s = scan(text)?;
    let root = s.root.ok_or(ClassifyError::NoRoot)?;
    let kind = kind_for_root(&root).ok_or_else(|| ClassifyError::UnknownRoot(root.clone()))?;

    let raw_key = match (&s.key_text, &s.key_attr) {
        (Some(k), _) => k.as_str(),
        (None, Some(id)) => key_from_id(id),
        (None, None) => return Err(ClassifyError::MissingAccessKey { root }),
    };
    let access_key = AccessKey::parse(raw_key).map_err(ClassifyError::AccessKey)?;
    let family = access_key
        .family()
        .ok_or_else(|| ClassifyError::UnknownModel(access_key.model().to_string()))?;

    let event = if kind == DocumentKind::Event {
        let code = s
            .event_code
            .ok_or_else(|| ClassifyError::MissingEventType { root: root.clone() })?;
        // Absent means the first occurrence.
        let sequence = match s.event_seq.as_deref() {
            None => 1,
            Some(v) => v
                .parse::<u32>()
                .map_err(|_| ClassifyError::InvalidEventSequence(v.to_string()))?,
        };
        Some(EventRef { code, sequence })
    } else {
        None
    };

    Ok(Classification {
        kind,
        access_key,
        family,
        schema_version: s.root_version,
        root,
        event,
    })
}

/// Decode and classify one distribution entry.
///
/// The entry's schema hint wins over the root `versao` attribute for the
/// stored schema version.
pub fn classify_entry(env: &DocumentEnvelope) -> Result<ClassifiedDocument, EntryError> {
    let bytes = decode(&env.payload).map_err(EntryError::Decode)?;
    classify_xml(bytes, env.nsu, env.schema.as_deref())
}

/// Classify an already-decoded document (targeted queries, tests).
pub fn classify_xml(
    bytes: Vec<u8>,
    nsu: Nsu,
    schema_hint: Option<&str>,
) -> Result<ClassifiedDocument, EntryError> {
    let c = classify(&bytes).map_err(EntryError::Classify)?;
    let xml = String::from_utf8(bytes).map_err(|_| EntryError::Classify(ClassifyError::NotUtf8))?;
    let xml = xml.trim_start_matches('\u{feff}').to_string();

    Ok(ClassifiedDocument {
        access_key: c.access_key,
        kind: c.kind,
        family: c.family,
        nsu,
        schema_version: schema_hint.and_then(schema_version).or(c.schema_version),
        root: c.root,
        event: c.event,
        xml,
    })
}
