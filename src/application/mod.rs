//! Application layer orchestrating transfers over the storage ports.
//!
//! `TransferEngine` is the entry point. It leans on the `ConcurrencyGuard` for
//! per-account and per-key ordering and on the `StatusNotifier` to push status
//! changes to subscribers.

pub mod audit;
pub mod engine;
pub mod guard;
pub mod notifier;
