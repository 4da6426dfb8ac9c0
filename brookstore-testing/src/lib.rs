//! Test support for `brookstore` document store adapters.
//!
//! - [`chaos`]: a fault-injecting [`DocumentStore`](brookstore::DocumentStore)
//!   wrapper with seeded random faults and scripted "fail the next calls" faults.
//! - [`contract`]: scenarios every adapter must pass, wired into a test
//!   module with [`document_store_contract_tests!`].

#![forbid(unsafe_code)]

pub mod chaos;
pub mod contract;

pub use chaos::*;
