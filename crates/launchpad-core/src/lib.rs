//! Core of the launchpad tooling.
//!
//! The crate exposes the building blocks the `launchpad` binaries are made of:
//!
//! * [`ledger`]: the [`ledger::LedgerClient`] abstraction over an EVM node,
//!   its alloy-backed JSON-RPC implementation, chunked log scanning and
//!   confirmation waits.
//! * [`descriptor`]: the launch descriptor, its validation, and the locked,
//!   atomically persisted checkpoint that orchestration mutates.
//! * [`orchestrator`]: the deploy-factory → create → fund state machine for
//!   one sale.
//! * [`aggregator`]: deterministic purchase statistics for a sale.
//!
//! [`contracts`] and [`units`] hold the contract surface and the exact
//! integer arithmetic the rest of the crate relies upon. Money never passes
//! through floating point except at the final display boundary.

pub mod aggregator;
pub mod contracts;
pub mod descriptor;
pub mod ledger;
pub mod orchestrator;
pub mod units;

mod error;

pub use error::LaunchpadError;
