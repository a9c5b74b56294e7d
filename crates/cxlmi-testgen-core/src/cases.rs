//! Test-case documents: an ordered list of mailbox commands with the request to send
//! and the response expected back.
//!
//! ```json
//! {
//!   "schema_version": "cxlmi-testgen.cases@0.1.0",
//!   "commands": [
//!     { "opcode": "0001", "response": { "vendor_id": "0x1af4", "device_id": "0x1234" } }
//!   ]
//! }
//! ```
//!
//! Strings and numbers are scalars, objects are embedded structs, arrays of objects
//! are struct arrays. Everything else is rejected here so the emitter never has to
//! guess a node's shape.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use cxlmi_testgen_contracts::CASES_SCHEMA_VERSION;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::diagnostics::{Diagnostic, DiagnosticCode};
use crate::field::{FieldNode, FieldValue, StructTree};
use crate::schema::Opcode;

/// Opcode as written in a test case. Text that is not a 4-digit hex value is kept
/// so the command can still be reported as unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOpcode {
    Known(Opcode),
    Unparsed(String),
}

impl CaseOpcode {
    pub fn known(&self) -> Option<&Opcode> {
        match self {
            CaseOpcode::Known(op) => Some(op),
            CaseOpcode::Unparsed(_) => None,
        }
    }
}

impl fmt::Display for CaseOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseOpcode::Known(op) => write!(f, "{op}"),
            CaseOpcode::Unparsed(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub opcode: CaseOpcode,
    pub request: Option<StructTree>,
    pub response: Option<StructTree>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCases {
    pub source_path: Option<String>,
    pub source_sha256: String,
    pub commands: Vec<CommandDescriptor>,
}

impl TestCases {
    /// Keeps only the commands for `opcode`, in document order.
    pub fn select_opcode(&self, opcode: &Opcode) -> TestCases {
        TestCases {
            source_path: self.source_path.clone(),
            source_sha256: self.source_sha256.clone(),
            commands: self
                .commands
                .iter()
                .filter(|c| c.opcode.known() == Some(opcode))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CasesDoc {
    schema_version: String,
    commands: Vec<RawCommand>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCommand {
    opcode: String,
    #[serde(default)]
    request: Option<Map<String, Value>>,
    #[serde(default)]
    response: Option<Map<String, Value>>,
}

pub fn load_file(path: &Path) -> Result<TestCases> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read test cases: {}", path.display()))?;
    let mut cases = parse_cases(&bytes)
        .with_context(|| format!("load test cases: {}", path.display()))?;
    cases.source_path = Some(path.to_string_lossy().to_string());
    Ok(cases)
}

pub fn parse_cases(bytes: &[u8]) -> Result<TestCases> {
    let doc: CasesDoc = serde_json::from_slice(bytes).map_err(|err| {
        anyhow::anyhow!(
            "{}",
            Diagnostic::new(DiagnosticCode::CTG0200CasesParse, err.to_string())
        )
    })?;
    if doc.schema_version.trim() != CASES_SCHEMA_VERSION {
        anyhow::bail!(
            "{}",
            Diagnostic::new(
                DiagnosticCode::CTG0201CasesSchemaVersion,
                format!(
                    "expected {CASES_SCHEMA_VERSION} got {:?}",
                    doc.schema_version
                )
            )
        );
    }

    let mut commands = Vec::with_capacity(doc.commands.len());
    for (idx, raw) in doc.commands.into_iter().enumerate() {
        let at = format!("commands[{idx}]");
        let opcode = parse_opcode(&raw.opcode, &at)?;
        let request = raw
            .request
            .map(|m| parse_root(&m, &format!("{at}.request")))
            .transpose()?;
        let response = raw
            .response
            .map(|m| parse_root(&m, &format!("{at}.response")))
            .transpose()?;
        commands.push(CommandDescriptor {
            opcode,
            request,
            response,
        });
    }

    Ok(TestCases {
        source_path: None,
        source_sha256: crate::util::sha256_hex(bytes),
        commands,
    })
}

fn parse_opcode(raw: &str, at: &str) -> Result<CaseOpcode> {
    if let Some(op) = Opcode::parse(raw) {
        return Ok(CaseOpcode::Known(op));
    }
    let text = raw.trim();
    if text.is_empty() || text.chars().any(char::is_control) {
        anyhow::bail!(
            "{}",
            Diagnostic::new(
                DiagnosticCode::CTG0210InvalidOpcode,
                format!("{at}.opcode: {raw:?}")
            )
        );
    }
    tracing::warn!(opcode = text, "{at}: opcode is not a 4-digit hex value");
    Ok(CaseOpcode::Unparsed(text.to_string()))
}

fn parse_root(obj: &Map<String, Value>, at: &str) -> Result<StructTree> {
    Ok(StructTree::new(parse_members(obj, at)?))
}

fn parse_members(obj: &Map<String, Value>, at: &str) -> Result<Vec<FieldNode>> {
    let mut out = Vec::with_capacity(obj.len());
    for (name, v) in obj {
        let here = format!("{at}.{name}");
        if !crate::util::is_ident(name) {
            return Err(invalid_field(&here, "member name is not a C identifier"));
        }
        let value = match v {
            Value::String(s) => {
                let lit = s.trim();
                if lit.is_empty() {
                    return Err(invalid_field(&here, "empty literal"));
                }
                FieldValue::Scalar(lit.to_string())
            }
            Value::Number(n) => FieldValue::Scalar(n.to_string()),
            Value::Object(m) => {
                if m.is_empty() {
                    return Err(invalid_field(&here, "empty struct"));
                }
                FieldValue::Composite(parse_members(m, &here)?)
            }
            Value::Array(items) => FieldValue::Array(parse_elements(items, &here)?),
            Value::Bool(_) => return Err(invalid_field(&here, "booleans are not C literals")),
            Value::Null => return Err(invalid_field(&here, "null")),
        };
        out.push(FieldNode {
            name: name.clone(),
            value,
        });
    }
    Ok(out)
}

fn parse_elements(items: &[Value], at: &str) -> Result<Vec<Vec<FieldNode>>> {
    if items.is_empty() {
        anyhow::bail!(
            "{}",
            Diagnostic::new(DiagnosticCode::CTG0221EmptyArray, at.to_string())
        );
    }
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let here = format!("{at}[{i}]");
        let Value::Object(m) = item else {
            return Err(invalid_field(&here, "array elements must be objects"));
        };
        if m.is_empty() {
            return Err(invalid_field(&here, "empty struct"));
        }
        out.push(parse_members(m, &here)?);
    }
    Ok(out)
}

fn invalid_field(at: &str, why: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "{}",
        Diagnostic::new(DiagnosticCode::CTG0220InvalidFieldNode, format!("{at}: {why}"))
    )
}
