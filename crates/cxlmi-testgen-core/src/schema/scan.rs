use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;

use super::{Opcode, OpcodeEntry, Suite};
use crate::diagnostics::{Diagnostic, DiagnosticCode};

/// Marks a handler prototype line (after trimming whitespace and backticks).
pub const HANDLER_PREFIX: &str = "int cxlmi_cmd";

/// Lines examined for `*in` / `*ret` parameters, counting the handler line itself.
pub const LOOKAHEAD_LINES: usize = 10;

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#+\s.*\(([0-9A-Fa-f]{4})h\)").expect("opcode heading regex")
});

static HANDLER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^int\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("handler regex")
});

static PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"struct\s+([A-Za-z_][A-Za-z0-9_]*)\s*\*\s*(in|ret)\b").expect("param regex")
});

#[derive(Debug)]
struct Section {
    opcode: Opcode,
    handler: Option<String>,
    request: Option<String>,
    response: Option<String>,
}

impl Section {
    fn open(opcode: Opcode) -> Self {
        Section {
            opcode,
            handler: None,
            request: None,
            response: None,
        }
    }

    fn entry(&self, suite: Suite) -> Option<OpcodeEntry> {
        Some(OpcodeEntry {
            opcode: self.opcode.clone(),
            handler: self.handler.clone()?,
            request_type: self.request.clone(),
            response_type: self.response.clone(),
            suite,
        })
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Params {
    request: Option<String>,
    response: Option<String>,
}

pub(super) fn scan_document(
    origin: &Path,
    src: &str,
    suite: Suite,
) -> Result<BTreeMap<Opcode, OpcodeEntry>> {
    let lines: Vec<&str> = src.lines().collect();
    let mut out: BTreeMap<Opcode, OpcodeEntry> = BTreeMap::new();
    let mut section: Option<Section> = None;

    for (idx, line) in lines.iter().enumerate() {
        if let Some(opcode) = heading_opcode(line) {
            section = Some(Section::open(opcode));
            continue;
        }

        let decl = strip_decoration(line);
        if !decl.starts_with(HANDLER_PREFIX) {
            continue;
        }

        let lno = idx + 1;
        let Some(caps) = HANDLER_RE.captures(decl) else {
            anyhow::bail!(
                "{}",
                Diagnostic::new(
                    DiagnosticCode::CTG0100MalformedHandlerDecl,
                    format!("{}:{}: {}", origin.display(), lno, decl)
                )
            );
        };
        let handler = caps[1].to_string();

        let Some(sec) = section.as_mut() else {
            tracing::debug!(
                document = %origin.display(),
                line = lno,
                %handler,
                "handler outside of an opcode section"
            );
            continue;
        };

        let params = scan_params(&lines[idx..]);
        sec.handler = Some(handler);
        if params.request.is_some() {
            sec.request = params.request;
        }
        if params.response.is_some() {
            sec.response = params.response;
        }

        if let Some(entry) = sec.entry(suite) {
            out.insert(entry.opcode.clone(), entry);
        }
    }

    Ok(out)
}

fn heading_opcode(line: &str) -> Option<Opcode> {
    let caps = HEADING_RE.captures(line.trim_end())?;
    Opcode::parse(&caps[1])
}

fn strip_decoration(line: &str) -> &str {
    line.trim().trim_matches('`').trim()
}

/// Looks for `struct <name> *in` / `struct <name> *ret` in the prototype starting at
/// `window[0]`. The first match per direction wins. Scanning stops at the end of the
/// parameter list, at a heading, or after `LOOKAHEAD_LINES` lines.
fn scan_params(window: &[&str]) -> Params {
    let mut params = Params::default();
    let mut depth: i32 = 0;
    let mut opened = false;

    for (offset, line) in window.iter().take(LOOKAHEAD_LINES).enumerate() {
        if offset > 0 && HEADING_RE.is_match(line) {
            break;
        }
        for caps in PARAM_RE.captures_iter(line) {
            let ty = format!("struct {}", &caps[1]);
            let slot = match &caps[2] {
                "in" => &mut params.request,
                _ => &mut params.response,
            };
            if slot.is_none() {
                *slot = Some(ty);
            }
        }
        for c in line.chars() {
            match c {
                '(' => {
                    depth += 1;
                    opened = true;
                }
                ')' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            break;
        }
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(src: &str) -> BTreeMap<Opcode, OpcodeEntry> {
        scan_document(Path::new("doc.md"), src, Suite::GenericComponent).unwrap()
    }

    fn op(s: &str) -> Opcode {
        Opcode::parse(s).unwrap()
    }

    #[test]
    fn response_only_handler() {
        let m = scan(
            "# Generic Component Commands\n\
             \n\
             ## Identify (0001h)\n\
             \n\
             Return type: `struct cxlmi_cmd_identify_rsp`\n\
             \n\
             ```C\n\
             int cxlmi_cmd_identify(struct cxlmi_endpoint *ep, struct cxlmi_tunnel_info *ti,\n\
             \t\t\tstruct cxlmi_cmd_identify_rsp *ret);\n\
             ```\n",
        );
        let e = m.get(&op("0001")).unwrap();
        assert_eq!(e.handler, "cxlmi_cmd_identify");
        assert_eq!(e.request_type, None);
        assert_eq!(
            e.response_type.as_deref(),
            Some("struct cxlmi_cmd_identify_rsp")
        );
        assert_eq!(e.suite, Suite::GenericComponent);
    }

    #[test]
    fn request_and_response_handler_in_backticks() {
        let m = scan(
            "## Get Log (0401h)\n\
             `int cxlmi_cmd_get_log_cel(struct cxlmi_endpoint *ep,`\n\
             `    struct cxlmi_tunnel_info *ti,`\n\
             `    struct cxlmi_cmd_get_log_req *in,`\n\
             `    struct cxlmi_cmd_get_log_cel_rsp *ret);`\n",
        );
        let e = m.get(&op("0401")).unwrap();
        assert_eq!(e.handler, "cxlmi_cmd_get_log_cel");
        assert_eq!(e.request_type.as_deref(), Some("struct cxlmi_cmd_get_log_req"));
        assert_eq!(
            e.response_type.as_deref(),
            Some("struct cxlmi_cmd_get_log_cel_rsp")
        );
    }

    #[test]
    fn uppercase_hex_heading_is_normalized() {
        let m = scan(
            "## Get Alert Configuration (4A00h)\n\
             int cxlmi_cmd_memdev_get_alert_config(struct cxlmi_endpoint *ep, struct cxlmi_tunnel_info *ti,\n\
             struct cxlmi_cmd_memdev_get_alert_config_rsp *ret);\n",
        );
        let e = m.get(&op("4a00")).unwrap();
        assert_eq!(e.opcode.as_str(), "4a00");
        assert_eq!(e.handler, "cxlmi_cmd_memdev_get_alert_config");
        assert!(m.get(&op("4A00")).is_some());
    }

    #[test]
    fn pure_command_has_no_payload_types() {
        let m = scan(
            "## Request Abort Background Operation (0005h)\n\
             int cxlmi_cmd_request_bg_op_abort(struct cxlmi_endpoint *ep, struct cxlmi_tunnel_info *ti);\n",
        );
        let e = m.get(&op("0005")).unwrap();
        assert_eq!(e.handler, "cxlmi_cmd_request_bg_op_abort");
        assert_eq!(e.request_type, None);
        assert_eq!(e.response_type, None);
    }

    #[test]
    fn heading_without_handler_stays_unmapped() {
        let m = scan(
            "## Get Response Message Limit (0003h)\n\
             Not supported yet.\n\
             ## Background Operation Status (0002h)\n\
             int cxlmi_cmd_bg_op_status(struct cxlmi_endpoint *ep, struct cxlmi_tunnel_info *ti,\n\
             struct cxlmi_cmd_bg_op_status_rsp *ret);\n",
        );
        assert!(m.get(&op("0003")).is_none());
        assert!(m.get(&op("0002")).is_some());
    }

    #[test]
    fn direction_markers_match_whole_words_only() {
        let m = scan(
            "## Set Timestamp (0301h)\n\
             int cxlmi_cmd_set_timestamp(struct cxlmi_endpoint *ep, struct cxlmi_tunnel_info *ti,\n\
             struct cxlmi_cmd_foo *input, struct cxlmi_cmd_bar *retval,\n\
             struct cxlmi_cmd_set_timestamp_req *in);\n",
        );
        let e = m.get(&op("0301")).unwrap();
        assert_eq!(
            e.request_type.as_deref(),
            Some("struct cxlmi_cmd_set_timestamp_req")
        );
        assert_eq!(e.response_type, None);
    }

    #[test]
    fn first_match_per_direction_wins() {
        let p = scan_params(&[
            "int cxlmi_cmd_x(struct a *in, struct b *in,",
            "struct c *ret, struct d *ret);",
        ]);
        assert_eq!(p.request.as_deref(), Some("struct a"));
        assert_eq!(p.response.as_deref(), Some("struct c"));
    }

    #[test]
    fn lookahead_stops_at_end_of_prototype() {
        let m = scan(
            "## Get Timestamp (0300h)\n\
             int cxlmi_cmd_get_timestamp(struct cxlmi_endpoint *ep, struct cxlmi_tunnel_info *ti,\n\
             struct cxlmi_cmd_get_timestamp_rsp *ret);\n\
             Example request payload: struct cxlmi_cmd_unrelated *in\n",
        );
        assert_eq!(m.get(&op("0300")).unwrap().request_type, None);
    }

    #[test]
    fn lookahead_is_bounded() {
        let mut src = String::from("## Long (0400h)\nint cxlmi_cmd_long(\n");
        for _ in 0..LOOKAHEAD_LINES {
            src.push_str("    int pad,\n");
        }
        src.push_str("    struct cxlmi_cmd_long_rsp *ret);\n");
        let m = scan(&src);
        assert_eq!(m.get(&op("0400")).unwrap().response_type, None);
    }

    #[test]
    fn handler_before_any_heading_is_ignored() {
        let m = scan("int cxlmi_cmd_orphan(struct cxlmi_endpoint *ep);\n");
        assert!(m.is_empty());
    }

    #[test]
    fn malformed_handler_line_names_document_and_line() {
        let err = scan_document(
            Path::new("docs/FM-API.md"),
            "## Identify Switch Device (5100h)\n\nint cxlmi_cmd_fmapi_identify_sw_device\n",
            Suite::FmApi,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("CTG0100"), "{msg}");
        assert!(msg.contains("docs/FM-API.md:3"), "{msg}");
    }

    #[test]
    fn later_section_in_same_document_overwrites() {
        let m = scan(
            "## Identify (0001h)\n\
             int cxlmi_cmd_identify(struct cxlmi_endpoint *ep);\n\
             ## Identify again (0001h)\n\
             int cxlmi_cmd_identify_v2(struct cxlmi_endpoint *ep);\n",
        );
        assert_eq!(m.get(&op("0001")).unwrap().handler, "cxlmi_cmd_identify_v2");
    }
}
