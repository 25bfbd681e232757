//! Helpers for callers that drive a kernel session.
//!
//! Provides:
//! - `execute_cell` - Run one notebook cell with composable cancellation
//! - `ExecutionCounter` - Notebook-style execution numbering
//! - `SessionHandle` - Current session, restarted while the server is up
//! - `run_code_once` - Fresh-session code run rendered as text

pub mod cell;
pub mod counter;
pub mod handle;
pub mod tool;

pub use cell::{CancelHandle, CellOutcome, execute_cell};
pub use counter::ExecutionCounter;
pub use handle::SessionHandle;
pub use tool::{ToolOutput, run_code_once, run_code_with};
