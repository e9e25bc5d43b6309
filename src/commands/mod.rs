//! CLI command handlers.
//!
//! One file per subcommand. Each handler loads config, connects the
//! gateway, does its work, and returns; only `run` stays resident.

mod flatten;
mod protect;
mod run;
mod status;

pub use flatten::run_flatten;
pub use protect::run_protect;
pub use run::run_engine;
pub use status::run_status;
