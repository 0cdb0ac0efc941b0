//! A caching layer for remote git repositories.
//!
//! For each remote URL there is exactly one bare mirror on disk; working
//! checkouts reference its object store through git's alternates mechanism,
//! so a second clone of the same URL costs almost nothing and history is
//! stored once no matter how many checkouts exist.

#[macro_use]
extern crate derive_builder;

pub mod cache;
pub mod config;
pub mod error;
pub mod git;
pub mod github;
pub mod identity;
pub mod lifecycle;
pub mod lock;
pub mod metadata;
pub mod mirrors;
pub mod progress;
pub mod repair;
pub mod strategy;
pub mod submodule;
pub mod validate;

pub use cache::{CloneRequest, CloneRequestBuilder, GitCache};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use identity::{parse_url, paths, PathTriple, RemoteIdentity};
pub use strategy::{Strategy, StrategyArg};
