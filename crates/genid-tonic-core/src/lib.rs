#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Re-exported so downstream crates reach `genid` through
// `genid_tonic_core::genid`.
pub use genid;
