use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Extract,
    Load,
    Emit,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiagnosticCode {
    CTG0001DocumentRead,
    CTG0002DocumentEncoding,
    CTG0100MalformedHandlerDecl,
    CTG0200CasesParse,
    CTG0201CasesSchemaVersion,
    CTG0210InvalidOpcode,
    CTG0220InvalidFieldNode,
    CTG0221EmptyArray,
    CTG0300ManifestInvalid,
    CTG0400UnknownOpcode,
    CTG0401MissingStructType,
    CTG0901InternalBug,
}

impl DiagnosticCode {
    pub fn code_str(self) -> &'static str {
        match self {
            DiagnosticCode::CTG0001DocumentRead => "CTG0001",
            DiagnosticCode::CTG0002DocumentEncoding => "CTG0002",
            DiagnosticCode::CTG0100MalformedHandlerDecl => "CTG0100",
            DiagnosticCode::CTG0200CasesParse => "CTG0200",
            DiagnosticCode::CTG0201CasesSchemaVersion => "CTG0201",
            DiagnosticCode::CTG0210InvalidOpcode => "CTG0210",
            DiagnosticCode::CTG0220InvalidFieldNode => "CTG0220",
            DiagnosticCode::CTG0221EmptyArray => "CTG0221",
            DiagnosticCode::CTG0300ManifestInvalid => "CTG0300",
            DiagnosticCode::CTG0400UnknownOpcode => "CTG0400",
            DiagnosticCode::CTG0401MissingStructType => "CTG0401",
            DiagnosticCode::CTG0901InternalBug => "CTG0901",
        }
    }

    pub fn phase(self) -> Phase {
        match self {
            DiagnosticCode::CTG0001DocumentRead
            | DiagnosticCode::CTG0002DocumentEncoding
            | DiagnosticCode::CTG0100MalformedHandlerDecl => Phase::Extract,
            DiagnosticCode::CTG0200CasesParse
            | DiagnosticCode::CTG0201CasesSchemaVersion
            | DiagnosticCode::CTG0210InvalidOpcode
            | DiagnosticCode::CTG0220InvalidFieldNode
            | DiagnosticCode::CTG0221EmptyArray
            | DiagnosticCode::CTG0300ManifestInvalid => Phase::Load,
            DiagnosticCode::CTG0400UnknownOpcode | DiagnosticCode::CTG0401MissingStructType => {
                Phase::Emit
            }
            DiagnosticCode::CTG0901InternalBug => Phase::Internal,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            DiagnosticCode::CTG0400UnknownOpcode | DiagnosticCode::CTG0401MissingStructType => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            DiagnosticCode::CTG0001DocumentRead => "failed to read specification document",
            DiagnosticCode::CTG0002DocumentEncoding => "specification document is not UTF-8",
            DiagnosticCode::CTG0100MalformedHandlerDecl => "malformed handler declaration",
            DiagnosticCode::CTG0200CasesParse => "failed to parse test-case document",
            DiagnosticCode::CTG0201CasesSchemaVersion => "test-case schema_version mismatch",
            DiagnosticCode::CTG0210InvalidOpcode => "opcode is empty or spans lines",
            DiagnosticCode::CTG0220InvalidFieldNode => "unsupported field value",
            DiagnosticCode::CTG0221EmptyArray => "array field has no elements",
            DiagnosticCode::CTG0300ManifestInvalid => "invalid manifest",
            DiagnosticCode::CTG0400UnknownOpcode => "opcode not found in specification documents",
            DiagnosticCode::CTG0401MissingStructType => {
                "payload given for a direction the handler does not take"
            }
            DiagnosticCode::CTG0901InternalBug => "internal cxlmi-testgen bug",
        }
    }

    pub fn default_help(self) -> Option<&'static str> {
        match self {
            DiagnosticCode::CTG0100MalformedHandlerDecl => Some(
                "Handler declarations must look like `int cxlmi_cmd_<name>(...)`.",
            ),
            DiagnosticCode::CTG0220InvalidFieldNode => Some(
                "Use strings or numbers for scalars, objects for structs and arrays of objects for struct arrays.",
            ),
            DiagnosticCode::CTG0400UnknownOpcode => {
                Some("Check that the opcode heading exists in one of the manifest documents.")
            }
            DiagnosticCode::CTG0901InternalBug => Some(
                "This is a bug in cxlmi-testgen. Please report it with the input documents.",
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub phase: Phase,
    pub severity: Severity,
    pub message: String,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn new(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Diagnostic {
            code,
            phase: code.phase(),
            severity: code.severity(),
            message: message.into(),
            help: code.default_help().map(|s| s.to_string()),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {:?}: {}",
            self.code.code_str(),
            self.phase,
            self.severity,
            self.message
        )?;
        if let Some(help) = &self.help {
            write!(f, "\n  help: {help}")?;
        }
        Ok(())
    }
}

pub fn render_diagnostics_md() -> String {
    let mut codes = all_codes().to_vec();
    codes.sort_by_key(|c| c.code_str());

    let mut out = String::new();
    out.push_str("# cxlmi-testgen diagnostics catalog\n\n");
    out.push_str(
        "This document is generated from `crates/cxlmi-testgen-core/src/diagnostics.rs`.\n\n",
    );
    out.push_str("| Code | Phase | Severity | Message | Help |\n");
    out.push_str("| ---- | ----- | -------- | ------- | ---- |\n");
    for code in codes {
        out.push_str(&format!(
            "| {} | {:?} | {:?} | {} | {} |\n",
            code.code_str(),
            code.phase(),
            code.severity(),
            code.default_message(),
            code.default_help().unwrap_or("")
        ));
    }
    out
}

fn all_codes() -> &'static [DiagnosticCode] {
    &[
        DiagnosticCode::CTG0001DocumentRead,
        DiagnosticCode::CTG0002DocumentEncoding,
        DiagnosticCode::CTG0100MalformedHandlerDecl,
        DiagnosticCode::CTG0200CasesParse,
        DiagnosticCode::CTG0201CasesSchemaVersion,
        DiagnosticCode::CTG0210InvalidOpcode,
        DiagnosticCode::CTG0220InvalidFieldNode,
        DiagnosticCode::CTG0221EmptyArray,
        DiagnosticCode::CTG0300ManifestInvalid,
        DiagnosticCode::CTG0400UnknownOpcode,
        DiagnosticCode::CTG0401MissingStructType,
        DiagnosticCode::CTG0901InternalBug,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_every_code_once() {
        let md = render_diagnostics_md();
        for code in all_codes() {
            assert_eq!(md.matches(code.code_str()).count(), 1, "{}", code.code_str());
        }
    }

    #[test]
    fn display_includes_help_line() {
        let d = Diagnostic::new(DiagnosticCode::CTG0400UnknownOpcode, "opcode 9999");
        let s = d.to_string();
        assert!(s.starts_with("CTG0400 Emit Warning: opcode 9999"), "{s}");
        assert!(s.contains("\n  help: "), "{s}");
    }
}
