//! Domain model: money, accounts, ledger entries, queue tasks and the storage ports.

pub mod account;
pub mod ledger;
pub mod money;
pub mod ports;
pub mod task;
