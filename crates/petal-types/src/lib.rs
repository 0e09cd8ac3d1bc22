//! Shared data model for Petal.
//!
//! This crate contains the types exchanged between the compiler, the engine
//! and the adapters:
//! - `document` -- raw short-form documents as authored
//! - `step` -- canonical, fully-resolved steps and their policies
//! - `expr` -- the compiled `if:` expression tree
//! - `lock` -- the lock artifact (plan + pins + provenance)
//! - `run` -- run state records, events and the run manifest
//! - `config` -- `petal.toml` settings
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod document;
pub mod duration;
pub mod expr;
pub mod lock;
pub mod run;
pub mod step;
pub mod value_type;
