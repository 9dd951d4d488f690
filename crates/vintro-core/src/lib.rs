//! Core types, configuration, and error handling for vintro.
//!
//! This crate provides the shared foundation used by all other vintro crates:
//! - [`VintroError`]: unified error type using `thiserror`
//! - [`VintroConfig`]: configuration loaded from `.vintro.toml`
//! - Shared types: [`CommitId`], [`OutputFormat`]

mod config;
mod error;
mod types;

pub use config::{
    BlameBackend, FetchConfig, IntroPatchSource, LogConfig, PathsConfig, ResolveConfig, RunConfig,
    VintroConfig,
};
pub use error::VintroError;
pub use types::{CommitId, OutputFormat};

/// A convenience `Result` type for vintro operations.
pub type Result<T> = std::result::Result<T, VintroError>;
