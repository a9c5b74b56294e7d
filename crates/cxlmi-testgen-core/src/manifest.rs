//! Run configuration: which documents define the opcode map and how each suite is
//! exercised.
//!
//! ```json
//! {
//!   "schema_version": "cxlmi-testgen.manifest@0.1.0",
//!   "documents": [
//!     { "path": "libcxlmi/docs/Generic-Component-Commands.md", "suite": "generic_component" },
//!     { "path": "libcxlmi/docs/Memory-Device-Commands.md", "suite": "memory_device" },
//!     { "path": "libcxlmi/docs/FM-API.md", "suite": "fm_api" }
//!   ],
//!   "suites": [
//!     {
//!       "suite": "memory_device",
//!       "cases": "cases/memdev.json",
//!       "transport": { "kind": "ioctl", "device": "mem0" },
//!       "qemu_topology": "-object memory-backend-ram,id=vmem0,share=on,size=512M ...",
//!       "setup": ["modprobe -a cxl_acpi cxl_core cxl_pci cxl_port cxl_mem"]
//!     }
//!   ]
//! }
//! ```
//!
//! Relative paths are resolved against the manifest's directory.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cxlmi_testgen_contracts::MANIFEST_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};

use crate::c_emit::Transport;
use crate::diagnostics::{Diagnostic, DiagnosticCode};
use crate::schema::{SpecDocument, Suite};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub schema_version: String,
    pub documents: Vec<SpecDocument>,
    #[serde(default)]
    pub suites: Vec<SuiteProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteProfile {
    pub suite: Suite,
    pub cases: PathBuf,
    #[serde(default)]
    pub transport: Transport,
    /// Device arguments handed to the VM launcher.
    #[serde(default)]
    pub qemu_topology: Option<String>,
    /// Commands run in the environment after it starts (driver loading, MCTP setup).
    #[serde(default)]
    pub setup: Vec<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Manifest> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read manifest: {}", path.display()))?;
        let mut m: Manifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse manifest JSON: {}", path.display()))?;
        m.validate()
            .with_context(|| format!("manifest: {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        m.resolve_paths(base);
        Ok(m)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version.trim() != MANIFEST_SCHEMA_VERSION {
            return Err(invalid(format!(
                "schema_version mismatch: expected {MANIFEST_SCHEMA_VERSION} got {:?}",
                self.schema_version
            )));
        }
        if self.documents.is_empty() {
            return Err(invalid("no specification documents listed"));
        }
        let mut seen = BTreeSet::new();
        for (idx, p) in self.suites.iter().enumerate() {
            if !seen.insert(p.suite) {
                return Err(invalid(format!(
                    "suites[{idx}]: suite {} listed more than once",
                    p.suite
                )));
            }
            if let Transport::Ioctl { device } = &p.transport {
                if device.trim().is_empty() {
                    return Err(invalid(format!("suites[{idx}]: empty ioctl device name")));
                }
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        for d in &mut self.documents {
            d.path = resolve(base, &d.path);
        }
        for p in &mut self.suites {
            p.cases = resolve(base, &p.cases);
        }
    }

    pub fn profile(&self, suite: Suite) -> Option<&SuiteProfile> {
        self.suites.iter().find(|p| p.suite == suite)
    }
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    anyhow::anyhow!(
        "{}",
        Diagnostic::new(DiagnosticCode::CTG0300ManifestInvalid, msg)
    )
}
