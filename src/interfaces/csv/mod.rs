//! CSV adapters for batch input and output.

pub mod account_reader;
pub mod account_writer;
pub mod transfer_reader;
pub mod transfer_writer;
