//! Patch parsing and attribution-target selection.
//!
//! Turns unified diff text into per-file added, removed and context lines,
//! then decides which of those lines are worth tracing back through blame.

pub mod filter;
pub mod parser;
pub mod select;
