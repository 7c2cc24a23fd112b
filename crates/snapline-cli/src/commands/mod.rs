//! CLI command implementations.

pub mod maintenance;
pub mod table;
