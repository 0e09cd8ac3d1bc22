//! Compiler, planner, cache engine and execution engine for Petal.
//!
//! This crate defines the ports (adapters, run store, cache store, secret
//! resolver, document source) that `petal-infra` implements. It depends only
//! on `petal-types`, never on `petal-infra` or any process, network or
//! keychain crate.

pub mod adapter;
pub mod cache;
pub mod compiler;
pub mod context;
pub mod dag;
pub mod diagnostic;
pub mod engine;
pub mod event;
pub mod expression;
pub mod hashing;
pub mod lock;
pub mod schema;
pub mod secrets;
pub mod store;
pub mod template;
