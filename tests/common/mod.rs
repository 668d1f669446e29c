//! tests/common/mod.rs
pub mod harness;
