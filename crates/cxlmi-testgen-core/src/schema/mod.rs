//! Opcode map extraction from the libcxlmi command documentation.
//!
//! Each Markdown document describes one command family. A section heading such as
//! `## Identify (0001h)` opens an opcode section, and the handler prototype inside it
//! (`int cxlmi_cmd_identify(..., struct cxlmi_cmd_identify_rsp *ret);`) names the
//! handler plus its request (`*in`) and response (`*ret`) structs.

mod scan;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Result;
use cxlmi_testgen_contracts::OPCODE_MAP_DUMP_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diagnostics::{Diagnostic, DiagnosticCode};

pub use scan::{HANDLER_PREFIX, LOOKAHEAD_LINES};

/// Lowercase 4-digit hex opcode, e.g. `0001` or `4100`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Opcode(String);

impl Opcode {
    /// Accepts `0001`, `0x0001`, `0001h` in any case.
    pub fn parse(raw: &str) -> Option<Opcode> {
        let s = raw.trim();
        let s = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let s = s
            .strip_suffix('h')
            .or_else(|| s.strip_suffix('H'))
            .unwrap_or(s);
        if s.len() != 4 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Opcode(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Document family an opcode was documented in. Routes an opcode to the VM topology
/// that can exercise it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suite {
    GenericComponent,
    MemoryDevice,
    FmApi,
    #[serde(other)]
    Unknown,
}

impl Suite {
    pub fn as_str(self) -> &'static str {
        match self {
            Suite::GenericComponent => "generic_component",
            Suite::MemoryDevice => "memory_device",
            Suite::FmApi => "fm_api",
            Suite::Unknown => "unknown",
        }
    }
}

impl FromStr for Suite {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "generic_component" => Ok(Suite::GenericComponent),
            "memory_device" => Ok(Suite::MemoryDevice),
            "fm_api" => Ok(Suite::FmApi),
            "unknown" => Ok(Suite::Unknown),
            other => anyhow::bail!(
                "unknown suite {other:?} (expected generic_component, memory_device, fm_api or unknown)"
            ),
        }
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcodeEntry {
    pub opcode: Opcode,
    pub handler: String,
    /// Full C type, e.g. `struct cxlmi_cmd_get_log_req`.
    pub request_type: Option<String>,
    pub response_type: Option<String>,
    pub suite: Suite,
}

/// Entries found in a single document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMap {
    pub origin: PathBuf,
    pub suite: Suite,
    pub entries: BTreeMap<Opcode, OpcodeEntry>,
}

/// A specification document plus the family it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecDocument {
    pub path: PathBuf,
    pub suite: Suite,
}

pub fn extract_str(origin: &Path, src: &str, suite: Suite) -> Result<DocumentMap> {
    let entries = scan::scan_document(origin, src, suite)?;
    tracing::debug!(
        document = %origin.display(),
        %suite,
        entries = entries.len(),
        "scanned specification document"
    );
    Ok(DocumentMap {
        origin: origin.to_path_buf(),
        suite,
        entries,
    })
}

pub fn extract_file(path: &Path, suite: Suite) -> Result<DocumentMap> {
    let bytes = std::fs::read(path).map_err(|err| {
        anyhow::anyhow!(
            "{}",
            Diagnostic::new(
                DiagnosticCode::CTG0001DocumentRead,
                format!("{}: {err}", path.display())
            )
        )
    })?;
    let Ok(src) = std::str::from_utf8(&bytes) else {
        anyhow::bail!(
            "{}",
            Diagnostic::new(
                DiagnosticCode::CTG0002DocumentEncoding,
                path.display().to_string()
            )
        );
    };
    extract_str(path, src, suite)
}

/// Immutable opcode -> entry mapping for one generation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpcodeMap {
    entries: BTreeMap<Opcode, OpcodeEntry>,
}

impl OpcodeMap {
    /// Folds per-document maps in order. A later document replaces the whole entry of
    /// an opcode an earlier document already defined.
    pub fn merge_last<I>(docs: I) -> OpcodeMap
    where
        I: IntoIterator<Item = DocumentMap>,
    {
        let entries = docs
            .into_iter()
            .fold(BTreeMap::new(), |mut acc, doc| {
                for (opcode, entry) in doc.entries {
                    if let Some(prev) = acc.insert(opcode, entry) {
                        tracing::debug!(
                            opcode = %prev.opcode,
                            previous_handler = %prev.handler,
                            document = %doc.origin.display(),
                            "opcode redefined by later document"
                        );
                    }
                }
                acc
            });
        OpcodeMap { entries }
    }

    /// Extracts every document; any unreadable or malformed document fails the whole call.
    pub fn from_documents(docs: &[SpecDocument]) -> Result<OpcodeMap> {
        let maps = docs
            .iter()
            .map(|d| extract_file(&d.path, d.suite))
            .collect::<Result<Vec<_>>>()?;
        let map = OpcodeMap::merge_last(maps);
        if map.is_empty() {
            tracing::warn!(
                documents = docs.len(),
                "no opcode sections with handler declarations found"
            );
        }
        tracing::info!(
            documents = docs.len(),
            opcodes = map.len(),
            "built opcode map"
        );
        Ok(map)
    }

    pub fn get(&self, opcode: &Opcode) -> Option<&OpcodeEntry> {
        self.entries.get(opcode)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpcodeEntry> {
        self.entries.values()
    }

    /// Human-readable listing, one block per opcode.
    pub fn render_dump(&self) -> String {
        let mut out = String::new();
        for e in self.iter() {
            out.push_str(&format!("Opcode: {}\n", e.opcode));
            out.push_str(&format!("  handler: {}\n", e.handler));
            out.push_str(&format!(
                "  request: {}\n",
                e.request_type.as_deref().unwrap_or("-")
            ));
            out.push_str(&format!(
                "  response: {}\n",
                e.response_type.as_deref().unwrap_or("-")
            ));
            out.push_str(&format!("  suite: {}\n\n", e.suite));
        }
        out
    }

    pub fn to_json_value(&self) -> Result<Value> {
        let entries = self
            .iter()
            .map(serde_json::to_value)
            .collect::<serde_json::Result<Vec<_>>>()?;
        Ok(serde_json::json!({
            "schema_version": OPCODE_MAP_DUMP_SCHEMA_VERSION,
            "entries": entries,
        }))
    }
}
