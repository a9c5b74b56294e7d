//! Generate, build and run test programs in a test environment.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

use crate::c_emit::{assemble, AssertMode, EmitOptions, GeneratedProgram};
use crate::cases::{self, TestCases};
use crate::manifest::{Manifest, SuiteProfile};
use crate::schema::{Opcode, OpcodeMap, Suite};

pub const ENV_CC: &str = "CXLMI_TESTGEN_CC";
pub const ENV_LIBCXLMI_ROOT: &str = "CXLMI_TESTGEN_LIBCXLMI_ROOT";

/// Last output line of a generated program that found no failures.
pub const PASS_MARKER: &str = "All tests passed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The machine the generated programs run on.
pub trait TestEnvironment {
    /// Boots the environment for a suite (VM topology, drivers).
    fn start(&mut self, profile: &SuiteProfile) -> Result<()>;

    fn copy_to_remote(&mut self, local: &Path, remote: &str) -> Result<()>;

    fn execute(&mut self, command: &str) -> Result<ExecOutput>;

    fn shutdown(&mut self) -> Result<()>;
}

/// Runs everything on the current host. Useful when the host itself has the CXL
/// devices or MCTP endpoints under test.
#[derive(Debug, Default)]
pub struct LocalEnvironment {
    started: bool,
}

impl TestEnvironment for LocalEnvironment {
    fn start(&mut self, profile: &SuiteProfile) -> Result<()> {
        tracing::info!(
            suite = %profile.suite,
            topology = profile.qemu_topology.as_deref().unwrap_or("-"),
            "local environment: no VM to start"
        );
        self.started = true;
        Ok(())
    }

    fn copy_to_remote(&mut self, local: &Path, remote: &str) -> Result<()> {
        let dst = Path::new(remote);
        if dst == local {
            return Ok(());
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir: {}", parent.display()))?;
        }
        std::fs::copy(local, dst)
            .with_context(|| format!("copy {} -> {}", local.display(), dst.display()))?;
        Ok(())
    }

    fn execute(&mut self, command: &str) -> Result<ExecOutput> {
        tracing::debug!(command, "exec");
        let out = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .with_context(|| format!("spawn sh -c {command:?}"))?;
        Ok(ExecOutput {
            exit_status: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.started {
            tracing::info!("local environment: nothing to shut down");
            self.started = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub assert_mode: AssertMode,
    /// Host directory for generated sources and results files.
    pub work_dir: PathBuf,
    /// Directory inside the environment that receives sources and binaries.
    pub remote_dir: String,
    /// libcxlmi checkout with `src/` headers and a `build/src` library.
    pub libcxlmi_root: String,
    pub cc: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            assert_mode: AssertMode::Continue,
            work_dir: PathBuf::from("."),
            remote_dir: "/tmp".to_string(),
            libcxlmi_root: "libcxlmi".to_string(),
            cc: "gcc".to_string(),
        }
    }
}

impl RunOptions {
    /// Applies `CXLMI_TESTGEN_CC` and `CXLMI_TESTGEN_LIBCXLMI_ROOT` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(cc) = env_nonempty(ENV_CC) {
            self.cc = cc;
        }
        if let Some(root) = env_nonempty(ENV_LIBCXLMI_ROOT) {
            self.libcxlmi_root = root;
        }
        self
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub name: String,
    pub suite: Suite,
    pub source_path: PathBuf,
    pub results_path: PathBuf,
    pub emitted: usize,
    pub skipped: usize,
    pub exit_status: i32,
    pub passed: bool,
}

/// Test cases and emit options for one suite profile, optionally narrowed to a
/// single opcode.
pub fn generate_for_profile(
    profile: &SuiteProfile,
    map: &OpcodeMap,
    opcode: Option<&Opcode>,
    assert_mode: AssertMode,
) -> Result<GeneratedProgram> {
    let all = cases::load_file(&profile.cases)?;
    let selected: TestCases = match opcode {
        Some(op) => all.select_opcode(op),
        None => all,
    };
    let opts = EmitOptions {
        assert_mode,
        transport: profile.transport.clone(),
        ..EmitOptions::default()
    };
    Ok(assemble(&selected, map, &opts))
}

/// Writes `program` to `path`. With `check` the file is compared instead and a
/// difference is an error.
pub fn write_program(path: &Path, program: &GeneratedProgram, check: bool) -> Result<()> {
    if check {
        let existing = std::fs::read(path)
            .with_context(|| format!("read existing program: {}", path.display()))?;
        if existing != program.source.as_bytes() {
            anyhow::bail!("generated program is out of date: {}", path.display());
        }
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir: {}", parent.display()))?;
        }
    }
    std::fs::write(path, program.source.as_bytes())
        .with_context(|| format!("write program: {}", path.display()))
}

pub fn run_suite(
    env: &mut dyn TestEnvironment,
    manifest: &Manifest,
    map: &OpcodeMap,
    suite: Suite,
    opts: &RunOptions,
) -> Result<RunOutcome> {
    let profile = manifest
        .profile(suite)
        .with_context(|| format!("no suite profile for {suite}"))?;
    let program = generate_for_profile(profile, map, None, opts.assert_mode)?;
    let name = suite.as_str().replace('_', "-");
    run_program(env, profile, &name, &program, opts)
}

/// Runs the test cases of one opcode in the environment of the suite that
/// documents it.
pub fn run_opcode(
    env: &mut dyn TestEnvironment,
    manifest: &Manifest,
    map: &OpcodeMap,
    opcode: &Opcode,
    opts: &RunOptions,
) -> Result<RunOutcome> {
    let entry = map
        .get(opcode)
        .with_context(|| format!("opcode {opcode} is not in the opcode map"))?;
    let profile = manifest
        .profile(entry.suite)
        .with_context(|| format!("no suite profile for {} (opcode {opcode})", entry.suite))?;
    let program = generate_for_profile(profile, map, Some(opcode), opts.assert_mode)?;
    if program.emitted == 0 {
        tracing::warn!(%opcode, "no test cases for opcode");
    }
    run_program(env, profile, opcode.as_str(), &program, opts)
}

/// Results of `run_all`: finished runs plus the suites that could not be run.
#[derive(Debug, Default)]
pub struct SuiteRuns {
    pub outcomes: Vec<RunOutcome>,
    pub errors: Vec<(Suite, anyhow::Error)>,
}

/// Runs every suite profile in manifest order. A suite that fails to run does not
/// stop the others.
pub fn run_all(
    env: &mut dyn TestEnvironment,
    manifest: &Manifest,
    map: &OpcodeMap,
    opts: &RunOptions,
) -> SuiteRuns {
    let mut runs = SuiteRuns::default();
    for profile in &manifest.suites {
        match run_suite(env, manifest, map, profile.suite, opts) {
            Ok(o) => runs.outcomes.push(o),
            Err(err) => {
                tracing::error!(suite = %profile.suite, "{err:#}");
                runs.errors.push((profile.suite, err));
            }
        }
    }
    runs
}

fn run_program(
    env: &mut dyn TestEnvironment,
    profile: &SuiteProfile,
    name: &str,
    program: &GeneratedProgram,
    opts: &RunOptions,
) -> Result<RunOutcome> {
    let source_path = opts.work_dir.join(format!("test-{name}.c"));
    write_program(&source_path, program, false)?;

    env.start(profile)
        .with_context(|| format!("start environment for {}", profile.suite))?;
    let result = build_and_execute(env, profile, name, &source_path, opts);
    let down = env.shutdown().context("shut down environment");
    let output = result?;
    down?;

    let results_path = opts.work_dir.join(format!("{name}-results.txt"));
    let mut report = format!("Test results for {name}:\n------\n");
    report.push_str(&output.stdout);
    if !output.stderr.is_empty() {
        report.push_str("------ stderr\n");
        report.push_str(&output.stderr);
    }
    std::fs::write(&results_path, report)
        .with_context(|| format!("write results: {}", results_path.display()))?;

    let passed = output.exit_status == 0 && reports_pass(&output.stdout);
    tracing::info!(
        name,
        passed,
        exit_status = output.exit_status,
        results = %results_path.display(),
        "test run finished"
    );

    Ok(RunOutcome {
        name: name.to_string(),
        suite: profile.suite,
        source_path,
        results_path,
        emitted: program.emitted,
        skipped: program.skipped,
        exit_status: output.exit_status,
        passed,
    })
}

fn build_and_execute(
    env: &mut dyn TestEnvironment,
    profile: &SuiteProfile,
    name: &str,
    source: &Path,
    opts: &RunOptions,
) -> Result<ExecOutput> {
    for cmd in &profile.setup {
        let out = env.execute(cmd)?;
        if out.exit_status != 0 {
            anyhow::bail!(
                "setup command failed ({}): {cmd}\n{}",
                out.exit_status,
                out.stderr
            );
        }
    }

    let remote_dir = opts.remote_dir.trim_end_matches('/');
    let remote_src = format!("{remote_dir}/test-{name}.c");
    let remote_bin = format!("{remote_dir}/test-{name}");
    env.copy_to_remote(source, &remote_src)?;

    let compile = compile_command(opts, &remote_src, &remote_bin);
    let out = env.execute(&compile)?;
    if out.exit_status != 0 {
        anyhow::bail!("compile failed ({}): {compile}\n{}", out.exit_status, out.stderr);
    }

    env.execute(&remote_bin)
}

pub fn compile_command(opts: &RunOptions, src: &str, bin: &str) -> String {
    let root = opts.libcxlmi_root.trim_end_matches('/');
    format!(
        "{cc} {src} -I{root}/src -L{root}/build/src -lcxlmi -Wl,-rpath,{root}/build/src -o {bin}",
        cc = opts.cc
    )
}

/// Whether the last non-empty output line is the pass marker.
pub fn reports_pass(stdout: &str) -> bool {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        == Some(PASS_MARKER)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use cxlmi_testgen_contracts::{CASES_SCHEMA_VERSION, MANIFEST_SCHEMA_VERSION};
    use serde_json::json;

    use super::*;
    use crate::c_emit::Transport;

    #[derive(Default)]
    struct Recording {
        calls: Vec<String>,
        replies: VecDeque<ExecOutput>,
    }

    impl Recording {
        fn replying(replies: Vec<(i32, &str)>) -> Self {
            Recording {
                calls: Vec::new(),
                replies: replies
                    .into_iter()
                    .map(|(code, out)| ExecOutput {
                        exit_status: code,
                        stdout: out.to_string(),
                        stderr: String::new(),
                    })
                    .collect(),
            }
        }
    }

    impl TestEnvironment for Recording {
        fn start(&mut self, profile: &SuiteProfile) -> Result<()> {
            self.calls.push(format!("start {}", profile.suite));
            Ok(())
        }

        fn copy_to_remote(&mut self, local: &Path, remote: &str) -> Result<()> {
            let name = local.file_name().unwrap().to_string_lossy();
            self.calls.push(format!("copy {name} {remote}"));
            Ok(())
        }

        fn execute(&mut self, command: &str) -> Result<ExecOutput> {
            self.calls.push(format!("exec {command}"));
            Ok(self.replies.pop_front().unwrap_or(ExecOutput {
                exit_status: 0,
                stdout: String::new(),
                stderr: String::new(),
            }))
        }

        fn shutdown(&mut self) -> Result<()> {
            self.calls.push("shutdown".to_string());
            Ok(())
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        manifest: Manifest,
        map: OpcodeMap,
        opts: RunOptions,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        std::fs::write(
            dir.join("Generic.md"),
            "## Identify (0001h)\n\
             int cxlmi_cmd_identify(struct cxlmi_endpoint *ep, struct cxlmi_tunnel_info *ti,\n\
             struct cxlmi_cmd_identify_rsp *ret);\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("FM-API.md"),
            "## Identify Switch Device (5100h)\n\
             int cxlmi_cmd_fmapi_identify_sw_device(struct cxlmi_endpoint *ep, struct cxlmi_tunnel_info *ti,\n\
             struct cxlmi_cmd_fmapi_identify_sw_device_rsp *ret);\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("generic.json"),
            serde_json::to_vec(&json!({
                "schema_version": CASES_SCHEMA_VERSION,
                "commands": [ { "opcode": "0001", "response": { "vendor_id": "0x1af4" } } ]
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.join("fmapi.json"),
            serde_json::to_vec(&json!({
                "schema_version": CASES_SCHEMA_VERSION,
                "commands": [ { "opcode": "5100", "response": { "num_physical_ports": 4 } } ]
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            serde_json::to_vec(&json!({
                "schema_version": MANIFEST_SCHEMA_VERSION,
                "documents": [
                    { "path": "Generic.md", "suite": "generic_component" },
                    { "path": "FM-API.md", "suite": "fm_api" }
                ],
                "suites": [
                    {
                        "suite": "generic_component",
                        "cases": "generic.json",
                        "setup": ["modprobe cxl_pci"]
                    },
                    { "suite": "fm_api", "cases": "fmapi.json" }
                ]
            }))
            .unwrap(),
        )
        .unwrap();

        let manifest = Manifest::load(&dir.join("manifest.json")).unwrap();
        let map = OpcodeMap::from_documents(&manifest.documents).unwrap();
        let opts = RunOptions {
            work_dir: dir.join("out"),
            remote_dir: "/root/".to_string(),
            libcxlmi_root: "/root/libcxlmi".to_string(),
            ..RunOptions::default()
        };
        Fixture {
            _tmp: tmp,
            manifest,
            map,
            opts,
        }
    }

    #[test]
    fn suite_run_sequence_and_results_file() {
        let f = fixture();
        let mut env = Recording::replying(vec![
            (0, ""),
            (0, ""),
            (0, "scanning dbus...\nfound 1 endpoint(s)\nAll tests passed\n\n"),
        ]);
        let out = run_suite(
            &mut env,
            &f.manifest,
            &f.map,
            Suite::GenericComponent,
            &f.opts,
        )
        .unwrap();

        assert_eq!(
            env.calls,
            vec![
                "start generic_component".to_string(),
                "exec modprobe cxl_pci".to_string(),
                "copy test-generic-component.c /root/test-generic-component.c".to_string(),
                "exec gcc /root/test-generic-component.c -I/root/libcxlmi/src \
                 -L/root/libcxlmi/build/src -lcxlmi -Wl,-rpath,/root/libcxlmi/build/src \
                 -o /root/test-generic-component"
                    .to_string(),
                "exec /root/test-generic-component".to_string(),
                "shutdown".to_string(),
            ]
        );
        assert!(out.passed);
        assert_eq!(out.emitted, 1);
        assert_eq!(out.name, "generic-component");

        let src = std::fs::read_to_string(&out.source_path).unwrap();
        assert!(src.contains("rc = cxlmi_cmd_identify(ep, NULL, actual_1);"));
        let results = std::fs::read_to_string(&out.results_path).unwrap();
        assert!(results.starts_with("Test results for generic-component:\n------\n"));
        assert!(results.contains("All tests passed"));
        assert_eq!(
            out.results_path.file_name().unwrap(),
            "generic-component-results.txt"
        );
    }

    #[test]
    fn failing_program_is_reported_not_raised() {
        let f = fixture();
        let mut env = Recording::replying(vec![
            (0, ""),
            (1, "Assertion failed: expected_1.num_physical_ports = 4, ...\n"),
        ]);
        let out = run_suite(&mut env, &f.manifest, &f.map, Suite::FmApi, &f.opts).unwrap();
        assert!(!out.passed);
        assert_eq!(out.exit_status, 1);
    }

    #[test]
    fn compile_failure_still_shuts_down() {
        let f = fixture();
        let mut env = Recording::replying(vec![(1, "")]);
        let err = run_suite(&mut env, &f.manifest, &f.map, Suite::FmApi, &f.opts).unwrap_err();
        assert!(format!("{err:#}").contains("compile failed"), "{err:#}");
        assert_eq!(env.calls.last().map(String::as_str), Some("shutdown"));
    }

    #[test]
    fn opcode_run_uses_the_suite_of_its_document() {
        let f = fixture();
        let mut env = Recording::replying(vec![(0, ""), (0, "All tests passed\n")]);
        let op = Opcode::parse("5100").unwrap();
        let out = run_opcode(&mut env, &f.manifest, &f.map, &op, &f.opts).unwrap();
        assert_eq!(out.suite, Suite::FmApi);
        assert_eq!(out.name, "5100");
        assert_eq!(env.calls[0], "start fm_api");
        assert!(out.passed);

        let unknown = Opcode::parse("9999").unwrap();
        assert!(run_opcode(&mut env, &f.manifest, &f.map, &unknown, &f.opts).is_err());
    }

    #[test]
    fn run_all_covers_every_profile() {
        let f = fixture();
        let mut env = Recording::default();
        let runs = run_all(&mut env, &f.manifest, &f.map, &f.opts);
        assert!(runs.errors.is_empty());
        let names: Vec<&str> = runs.outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["generic-component", "fm-api"]);
        assert!(runs.outcomes.iter().all(|o| !o.passed));
        assert_eq!(env.calls.iter().filter(|c| *c == "shutdown").count(), 2);
    }

    #[test]
    fn run_all_keeps_outcomes_of_suites_that_ran() {
        let f = fixture();
        // generic_component: setup ok, compile fails. fm_api: compile ok, tests pass.
        let mut env =
            Recording::replying(vec![(0, ""), (1, ""), (0, ""), (0, "All tests passed\n")]);
        let runs = run_all(&mut env, &f.manifest, &f.map, &f.opts);

        assert_eq!(runs.errors.len(), 1);
        assert_eq!(runs.errors[0].0, Suite::GenericComponent);
        assert!(format!("{:#}", runs.errors[0].1).contains("compile failed"));

        assert_eq!(runs.outcomes.len(), 1);
        assert_eq!(runs.outcomes[0].suite, Suite::FmApi);
        assert!(runs.outcomes[0].passed);
        assert!(runs.outcomes[0].results_path.is_file());
    }

    #[test]
    fn generate_for_profile_applies_transport() {
        let f = fixture();
        let mut profile = f.manifest.profile(Suite::FmApi).unwrap().clone();
        profile.transport = Transport::Ioctl {
            device: "switch0".to_string(),
        };
        let p = generate_for_profile(&profile, &f.map, None, AssertMode::Abort).unwrap();
        assert!(p.source.contains("cxlmi_open(ctx, \"switch0\")"));
        assert!(p.source.contains("ASSERT_EQUAL_FATAL(expected_1.num_physical_ports"));
    }

    #[test]
    fn check_mode_detects_stale_output() {
        let f = fixture();
        let profile = f.manifest.profile(Suite::FmApi).unwrap();
        let p = generate_for_profile(profile, &f.map, None, AssertMode::Continue).unwrap();
        let path = f.opts.work_dir.join("gen/test.c");
        write_program(&path, &p, false).unwrap();
        write_program(&path, &p, true).unwrap();
        std::fs::write(&path, "stale").unwrap();
        assert!(write_program(&path, &p, true).is_err());
    }

    #[test]
    fn pass_marker_must_be_last_line() {
        assert!(reports_pass("x\nAll tests passed\n\n"));
        assert!(!reports_pass("All tests passed\nAssertion failed: a = 1, b = 2\n"));
        assert!(!reports_pass(""));
    }

    #[test]
    fn local_environment_runs_shell_commands() {
        let mut env = LocalEnvironment::default();
        let out = env.execute("echo hi; exit 3").unwrap();
        assert_eq!(out.exit_status, 3);
        assert_eq!(out.stdout, "hi\n");

        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.c");
        std::fs::write(&src, "int main(void){return 0;}").unwrap();
        let dst = tmp.path().join("remote/a.c");
        env.copy_to_remote(&src, dst.to_str().unwrap()).unwrap();
        assert!(dst.is_file());
    }
}
