//! Infrastructure layer for Petal.
//!
//! Implements the ports defined in `petal-core`: execution adapters
//! (process, container, interpreter, HTTP, LLM), the filesystem cache store,
//! per-run directories, the on-disk document loader, environment and OS
//! keychain secret resolvers, and the `petal.toml` settings loader.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod keychain;
pub mod run_dir;
pub mod secret;
pub mod source;
