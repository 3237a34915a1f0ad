#![doc = include_str!("../README.md")]

mod error;
mod generator;
mod protocol;
mod registry;
mod segment;
pub mod store;
#[cfg(test)]
mod test_support;

pub use crate::error::*;
pub use crate::generator::*;
pub use crate::protocol::*;
pub use crate::registry::*;
pub use crate::segment::*;
pub use crate::store::{CounterRow, CounterStore, MemoryCounterStore, Reservation, StoreError};
