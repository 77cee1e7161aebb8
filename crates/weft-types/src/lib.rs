//! Shared domain types for Weft.
//!
//! This crate contains the types exchanged between the engine, its callers,
//! and its observers: the workflow graph, block and run results, trace
//! events, engine configuration, and the error taxonomy.
//!
//! Zero runtime dependencies -- only serde, chrono, thiserror, schemars (graph schema).

pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod result;
