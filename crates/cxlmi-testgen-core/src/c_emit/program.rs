use cxlmi_testgen_contracts::GENERATOR_ID;
use serde::{Deserialize, Serialize};

use super::structs::{pad, render, Assertion, Place, Seq};
use crate::cases::{CaseOpcode, CommandDescriptor, TestCases};
use crate::diagnostics::{Diagnostic, DiagnosticCode};
use crate::schema::{OpcodeEntry, OpcodeMap};

/// Commands are emitted at this depth: `main` body + endpoint loop.
const COMMAND_LEVEL: usize = 2;

/// What a failed check does in the generated program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertMode {
    /// Record the failure and keep checking.
    #[default]
    Continue,
    /// Record the failure and jump to cleanup.
    Abort,
}

impl AssertMode {
    fn macro_name(self) -> &'static str {
        match self {
            AssertMode::Continue => "ASSERT_EQUAL",
            AssertMode::Abort => "ASSERT_EQUAL_FATAL",
        }
    }
}

/// How the generated program reaches its endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    /// Discover endpoints over MCTP (D-Bus scan) and run every command on each.
    #[default]
    Mctp,
    /// Open one CXL device through the kernel ioctl interface, e.g. `mem0`.
    Ioctl { device: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitOptions {
    pub assert_mode: AssertMode,
    pub transport: Transport,
    /// Second argument of every handler call.
    pub tunnel: String,
}

impl Default for EmitOptions {
    fn default() -> Self {
        EmitOptions {
            assert_mode: AssertMode::Continue,
            transport: Transport::Mctp,
            tunnel: "NULL".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedProgram {
    pub source: String,
    pub emitted: usize,
    pub skipped: usize,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn assemble(cases: &TestCases, map: &OpcodeMap, opts: &EmitOptions) -> GeneratedProgram {
    let mut body = String::new();
    let mut diagnostics = Vec::new();
    let mut emitted = 0;
    let mut seq = Seq::first();

    for cmd in &cases.commands {
        match emit_command(cmd, map, opts, seq) {
            Ok(code) => {
                body.push_str(&code);
                emitted += 1;
            }
            Err(diag) => {
                tracing::warn!(opcode = %cmd.opcode, "{}", diag.message);
                body.push_str(&format!("{}// {}\n\n", pad(COMMAND_LEVEL), skip_marker(cmd, &diag)));
                diagnostics.push(diag);
            }
        }
        seq = seq.next();
    }

    let mut source = String::new();
    source.push_str(&format!(
        "/* Generated by {GENERATOR_ID}; test cases sha256:{}. Do not edit. */\n",
        cases.source_sha256
    ));
    source.push_str(PREAMBLE);
    source.push_str(ASSERT_MACROS);
    source.push_str(MAIN_SETUP);
    source.push_str(&endpoint_open(&opts.transport));
    source.push_str(&body);
    source.push_str(&endpoint_close(&opts.transport));
    source.push_str(&footer(opts.assert_mode));

    tracing::info!(
        emitted,
        skipped = diagnostics.len(),
        mode = ?opts.assert_mode,
        "assembled test program"
    );

    GeneratedProgram {
        source,
        emitted,
        skipped: diagnostics.len(),
        diagnostics,
    }
}

fn skip_marker(cmd: &CommandDescriptor, diag: &Diagnostic) -> String {
    match diag.code {
        DiagnosticCode::CTG0400UnknownOpcode => format!("Unknown opcode {}", cmd.opcode),
        _ => format!("Skipped opcode {}: {}", cmd.opcode, diag.message),
    }
}

fn emit_command(
    cmd: &CommandDescriptor,
    map: &OpcodeMap,
    opts: &EmitOptions,
    seq: Seq,
) -> Result<String, Diagnostic> {
    let Some(entry) = cmd.opcode.known().and_then(|op| map.get(op)) else {
        return Err(Diagnostic::new(
            DiagnosticCode::CTG0400UnknownOpcode,
            format!("opcode {} has no handler", cmd.opcode),
        ));
    };

    let outer = pad(COMMAND_LEVEL);
    let level = COMMAND_LEVEL + 1;
    let ind = pad(level);
    let handler = entry.handler.as_str();

    let mut decls = String::new();

    let request_arg = match cmd.request.as_ref().filter(|t| !t.is_empty()) {
        None => {
            if entry.request_type.is_some() {
                tracing::warn!(
                    opcode = %cmd.opcode,
                    handler,
                    "handler takes a request but the test case has none"
                );
            }
            None
        }
        Some(tree) => {
            let ty = payload_type(entry, entry.request_type.as_deref(), "request")?;
            let var = seq.request();
            let place = Place::value(var.as_str());
            let r = render(tree, ty, &place, &place, level).ok_or_else(internal_empty_tree)?;
            decls.push_str(&r.declaration(&var, level));
            Some(format!("&{var}"))
        }
    };

    let mut assertions: Vec<Assertion> = Vec::new();
    let response_arg = match cmd.response.as_ref() {
        None => None,
        Some(tree) => {
            let ty = payload_type(entry, entry.response_type.as_deref(), "response")?;
            let expected = seq.expected();
            let actual = seq.actual();
            if let Some(r) = render(
                tree,
                ty,
                &Place::value(expected.as_str()),
                &Place::pointer(actual.as_str()),
                level,
            ) {
                decls.push_str(&r.declaration(&expected, level));
                assertions = r.assertions;
            }
            decls.push_str(&format!("{ind}{ty} *{actual} = ({ty} *) buf;\n"));
            decls.push_str(&format!("{ind}memset(buf, 0, MAX_PAYLOAD_SIZE);\n"));
            Some(actual)
        }
    };

    let mut args = vec!["ep".to_string(), opts.tunnel.clone()];
    args.extend(request_arg);
    args.extend(response_arg);

    let on_failure = match opts.assert_mode {
        AssertMode::Continue => "break;",
        AssertMode::Abort => "goto cleanup;",
    };

    let mut out = String::new();
    out.push_str(&format!("{outer}/* {} {handler} */\n", cmd.opcode));
    out.push_str(&format!("{outer}do {{\n"));
    out.push_str(&decls);
    out.push('\n');
    out.push_str(&format!("{ind}rc = {handler}({});\n", args.join(", ")));
    out.push_str(&format!("{ind}if (rc != 0) {{\n"));
    out.push_str(&format!(
        "{ind}    fprintf(stderr, \"Error: Function {handler} returned non-zero rc: %d\\n\", rc);\n"
    ));
    out.push_str(&format!("{ind}    status = EXIT_FAILURE;\n"));
    out.push_str(&format!("{ind}    {on_failure}\n"));
    out.push_str(&format!("{ind}}}\n"));
    let macro_name = opts.assert_mode.macro_name();
    for a in &assertions {
        out.push_str(&format!(
            "{ind}{macro_name}({}, {});\n",
            a.expected, a.actual
        ));
    }
    out.push_str(&format!("{outer}}} while (0);\n\n"));
    Ok(out)
}

fn payload_type<'a>(
    entry: &OpcodeEntry,
    ty: Option<&'a str>,
    direction: &str,
) -> Result<&'a str, Diagnostic> {
    ty.ok_or_else(|| {
        Diagnostic::new(
            DiagnosticCode::CTG0401MissingStructType,
            format!(
                "{} takes no {direction} struct but the test case has a {direction}",
                entry.handler
            ),
        )
    })
}

fn internal_empty_tree() -> Diagnostic {
    Diagnostic::new(
        DiagnosticCode::CTG0901InternalBug,
        "non-empty tree rendered to nothing",
    )
}

fn endpoint_open(transport: &Transport) -> String {
    match transport {
        Transport::Mctp => MCTP_OPEN.to_string(),
        Transport::Ioctl { device } => {
            let dev = c_string_literal(device);
            format!(
                "    ep = cxlmi_open(ctx, {dev});\n    \
                 if (!ep) {{\n        \
                 fprintf(stderr, \"cannot open '%s' endpoint\\n\", {dev});\n        \
                 status = EXIT_FAILURE;\n        \
                 goto exit_free_ctx;\n    \
                 }}\n\n    \
                 {{\n"
            )
        }
    }
}

fn endpoint_close(transport: &Transport) -> String {
    match transport {
        Transport::Mctp => "        cxlmi_close(ep);\n    }\n".to_string(),
        Transport::Ioctl { .. } => "    }\n".to_string(),
    }
}

fn c_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

const PREAMBLE: &str = "#include <stdio.h>
#include <stdlib.h>
#include <string.h>
#include <libcxlmi.h>

#define MAX_PAYLOAD_SIZE 4096
";

const ASSERT_MACROS: &str = r#"
#define ASSERT_EQUAL(expected, actual) \
    do { \
        if ((expected) != (actual)) { \
            printf("Assertion failed: %s = %llu, %s = %llu\n", \
                   #expected, (unsigned long long)(expected), \
                   #actual, (unsigned long long)(actual)); \
            status = EXIT_FAILURE; \
        } \
    } while (0)

#define ASSERT_EQUAL_FATAL(expected, actual) \
    do { \
        if ((expected) != (actual)) { \
            printf("Assertion failed: %s = %llu, %s = %llu\n", \
                   #expected, (unsigned long long)(expected), \
                   #actual, (unsigned long long)(actual)); \
            status = EXIT_FAILURE; \
            goto cleanup; \
        } \
    } while (0)
"#;

const MAIN_SETUP: &str = "
int main(void)
{
    struct cxlmi_ctx *ctx;
    struct cxlmi_endpoint *ep, *tmp;
    int rc = 0;
    int status = EXIT_SUCCESS;
    void *buf = calloc(1, MAX_PAYLOAD_SIZE);

    if (buf == NULL) {
        fprintf(stderr, \"cannot allocate payload buffer\\n\");
        return EXIT_FAILURE;
    }
    ctx = cxlmi_new_ctx(stderr, DEFAULT_LOGLEVEL);
    if (ctx == NULL) {
        fprintf(stderr, \"cannot create libcxlmi context\\n\");
        free(buf);
        return EXIT_FAILURE;
    }

";

const MCTP_OPEN: &str = "    printf(\"scanning dbus...\\n\");

    int num_ep = cxlmi_scan_mctp(ctx);
    if (num_ep < 0) {
        fprintf(stderr, \"dbus scan error\\n\");
        status = EXIT_FAILURE;
        goto exit_free_ctx;
    } else if (num_ep == 0) {
        printf(\"no endpoints found\\n\");
        status = EXIT_FAILURE;
        goto exit_free_ctx;
    }
    printf(\"found %d endpoint(s)\\n\", num_ep);

    cxlmi_for_each_endpoint_safe(ctx, ep, tmp) {
";

/// `cleanup:` is only a jump target in abort mode; otherwise control falls through.
fn footer(mode: AssertMode) -> String {
    match mode {
        AssertMode::Abort => format!("\ncleanup:{FOOTER}"),
        AssertMode::Continue => FOOTER.to_string(),
    }
}

const FOOTER: &str = "
    cxlmi_for_each_endpoint_safe(ctx, ep, tmp) {
        cxlmi_close(ep);
    }
exit_free_ctx:
    free(buf);
    cxlmi_free_ctx(ctx);
    (void) rc;
    if (status == EXIT_SUCCESS)
        printf(\"All tests passed\\n\");
    return status;
}
";
