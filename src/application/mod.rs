//! Application layer orchestrating the ledger.
//!
//! `LedgerService` runs the wallet operations against the storage ports, `TaskQueue`
//! carries transfer settlements to the background `Worker`.

pub mod ledger;
pub mod queue;
pub mod worker;
