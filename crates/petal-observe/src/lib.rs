//! Observability setup shared by Petal binaries.

pub mod tracing_setup;
