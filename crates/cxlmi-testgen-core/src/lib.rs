pub mod c_emit;
pub mod cases;
pub mod diagnostics;
pub mod field;
pub mod manifest;
pub mod orchestrate;
pub mod schema;

mod util;
