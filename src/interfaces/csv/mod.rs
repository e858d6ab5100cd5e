//! CSV adapters used by the command line binary.

pub mod account_writer;
pub mod command_reader;
