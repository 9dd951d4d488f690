//! Git history queries for vulnerability attribution.
//!
//! Opens and refreshes cached working copies, blames the parent revision
//! of a fix, and keeps only candidates that are true ancestors of it.

pub mod ancestry;
pub mod blame;
pub mod cache;
pub mod mining;
pub mod repo;
