//! Shared, version-pinned document identifiers.
//!
//! These constants are the single source of truth for schema/version strings that
//! appear in machine-readable inputs and outputs of the generator.

pub const CASES_SCHEMA_VERSION: &str = "cxlmi-testgen.cases@0.1.0";
pub const MANIFEST_SCHEMA_VERSION: &str = "cxlmi-testgen.manifest@0.1.0";
pub const OPCODE_MAP_DUMP_SCHEMA_VERSION: &str = "cxlmi-testgen.opcode-map@0.1.0";

pub const GENERATOR_ID: &str = "cxlmi-testgen";
