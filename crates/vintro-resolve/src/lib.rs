//! Turning vulnerability-fixing commits into the commits that introduced
//! the flaw.
//!
//! [`pipeline::Resolver`] drives the work: it syncs repositories, fetches
//! and parses fix patches, attributes their lines through blame and
//! persists one record per fix.

pub mod attribute;
pub mod audit;
pub mod manifest;
pub mod patch;
pub mod pipeline;
pub mod store;
