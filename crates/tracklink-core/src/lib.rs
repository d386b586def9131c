pub mod attribution;
pub mod config;
pub mod contact;
pub mod conversion;
pub mod disjoint_set;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod session;
