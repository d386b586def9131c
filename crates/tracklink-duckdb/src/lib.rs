pub mod attribution;
pub mod backend;
pub mod contacts;
pub mod engine_impl;
pub mod identity;
pub mod linker;
pub mod locks;
pub mod schema;
pub mod sessions;
pub mod touchpoints;

pub use backend::DuckDbBackend;

/// Re-export the `duckdb` crate so consumers (especially tests) can use
/// `tracklink_duckdb::duckdb::params!` without an extra dependency.
pub use duckdb;
