use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cxlmi_testgen_core::c_emit::{assemble, AssertMode, EmitOptions, Transport};
use cxlmi_testgen_core::manifest::Manifest;
use cxlmi_testgen_core::orchestrate::{self, LocalEnvironment, RunOptions, SuiteRuns};
use cxlmi_testgen_core::schema::{Opcode, OpcodeMap, Suite};
use cxlmi_testgen_core::{cases, diagnostics};

#[derive(Parser, Debug)]
#[command(name = "cxlmi-testgen")]
#[command(about = "Generate and run libcxlmi conformance test programs.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the opcode map from the manifest's documents and print it.
    Extract {
        #[arg(long)]
        manifest: PathBuf,
        /// Write the dump here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Generate one C test program from a test-case document.
    Gen {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        cases: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Stop at the first failed check instead of continuing.
        #[arg(long, default_value_t = false)]
        fatal: bool,
        /// Only emit the commands for this opcode.
        #[arg(long)]
        opcode: Option<String>,
        /// Open this device through the ioctl interface instead of scanning MCTP.
        #[arg(long)]
        ioctl_device: Option<String>,
        /// If set, fail if output differs; do not write.
        #[arg(long, default_value_t = false)]
        check: bool,
    },
    /// Generate, build and run test programs on this host.
    Run {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long, conflicts_with = "opcode")]
        suite: Option<Suite>,
        #[arg(long)]
        opcode: Option<String>,
        #[arg(long, default_value_t = false)]
        fatal: bool,
        /// Where generated sources and results files go.
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,
    },
    /// Print the diagnostics catalog as Markdown.
    Diagnostics,
}

fn main() -> ExitCode {
    init_tracing();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Extract {
            manifest,
            out,
            json,
        } => run_extract(&manifest, out.as_deref(), json),
        Command::Gen {
            manifest,
            cases,
            out,
            fatal,
            opcode,
            ioctl_device,
            check,
        } => run_gen(
            &manifest,
            &cases,
            &out,
            assert_mode(fatal),
            opcode.as_deref(),
            ioctl_device,
            check,
        ),
        Command::Run {
            manifest,
            suite,
            opcode,
            fatal,
            work_dir,
        } => run_tests(&manifest, suite, opcode.as_deref(), assert_mode(fatal), work_dir),
        Command::Diagnostics => {
            print!("{}", diagnostics::render_diagnostics_md());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn assert_mode(fatal: bool) -> AssertMode {
    if fatal {
        AssertMode::Abort
    } else {
        AssertMode::Continue
    }
}

fn parse_opcode(raw: &str) -> Result<Opcode> {
    Opcode::parse(raw).with_context(|| format!("invalid opcode {raw:?} (expected 4 hex digits)"))
}

fn load_map(manifest_path: &Path) -> Result<(Manifest, OpcodeMap)> {
    let manifest = Manifest::load(manifest_path)?;
    let map = OpcodeMap::from_documents(&manifest.documents)
        .with_context(|| format!("extract opcode map for {}", manifest_path.display()))?;
    Ok((manifest, map))
}

fn run_extract(manifest_path: &Path, out: Option<&Path>, json: bool) -> Result<ExitCode> {
    let (_, map) = load_map(manifest_path)?;
    let dump = if json {
        let mut s = serde_json::to_string_pretty(&map.to_json_value()?)?;
        s.push('\n');
        s
    } else {
        map.render_dump()
    };
    match out {
        Some(path) => std::fs::write(path, dump.as_bytes())
            .with_context(|| format!("write opcode map: {}", path.display()))?,
        None => print!("{dump}"),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_gen(
    manifest_path: &Path,
    cases_path: &Path,
    out: &Path,
    mode: AssertMode,
    opcode: Option<&str>,
    ioctl_device: Option<String>,
    check: bool,
) -> Result<ExitCode> {
    let (_, map) = load_map(manifest_path)?;
    let mut test_cases = cases::load_file(cases_path)?;
    if let Some(raw) = opcode {
        test_cases = test_cases.select_opcode(&parse_opcode(raw)?);
    }
    let opts = EmitOptions {
        assert_mode: mode,
        transport: match ioctl_device {
            Some(device) => Transport::Ioctl { device },
            None => Transport::Mctp,
        },
        ..EmitOptions::default()
    };
    let program = assemble(&test_cases, &map, &opts);
    orchestrate::write_program(out, &program, check)?;
    eprintln!(
        "{}: {} command(s) emitted, {} skipped",
        out.display(),
        program.emitted,
        program.skipped
    );
    Ok(ExitCode::SUCCESS)
}

fn run_tests(
    manifest_path: &Path,
    suite: Option<Suite>,
    opcode: Option<&str>,
    mode: AssertMode,
    work_dir: PathBuf,
) -> Result<ExitCode> {
    let (manifest, map) = load_map(manifest_path)?;
    let opts = RunOptions {
        assert_mode: mode,
        work_dir,
        ..RunOptions::default()
    }
    .with_env_overrides();
    std::fs::create_dir_all(&opts.work_dir)
        .with_context(|| format!("create work dir: {}", opts.work_dir.display()))?;

    let mut env = LocalEnvironment::default();
    let runs = match (suite, opcode) {
        (Some(suite), _) => SuiteRuns {
            outcomes: vec![orchestrate::run_suite(&mut env, &manifest, &map, suite, &opts)?],
            errors: Vec::new(),
        },
        (None, Some(raw)) => {
            let op = parse_opcode(raw)?;
            SuiteRuns {
                outcomes: vec![orchestrate::run_opcode(&mut env, &manifest, &map, &op, &opts)?],
                errors: Vec::new(),
            }
        }
        (None, None) => orchestrate::run_all(&mut env, &manifest, &map, &opts),
    };

    let mut all_passed = true;
    for o in &runs.outcomes {
        let verdict = if o.passed { "PASS" } else { "FAIL" };
        println!(
            "{verdict} {} ({} emitted, {} skipped) -> {}",
            o.name,
            o.emitted,
            o.skipped,
            o.results_path.display()
        );
        all_passed &= o.passed;
    }
    for (suite, err) in &runs.errors {
        eprintln!("ERROR {suite}: {err:#}");
    }

    Ok(if !runs.errors.is_empty() {
        ExitCode::from(2)
    } else if all_passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
