//! Session client for a remote compute kernel.
//!
//! Provides:
//! - `SessionClient` - Kernel lifecycle and single-in-flight execution
//! - `PendingExecution` - Completion handle for one `run_code` call
//! - The message router task that turns channel frames into output items

pub mod client;
mod router;

pub use client::{ExecutionOutcome, PendingExecution, SessionClient};
