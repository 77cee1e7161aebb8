//! Workflow execution engine for Weft.
//!
//! Loads and validates workflow graphs, resolves inter-block references,
//! evaluates routing and loop conditions, drives loop/parallel containers
//! and nested sub-workflow runs, and streams trace events to observers.
//! Tools are reached only through the `ToolCatalog` port in [`catalog`].

pub mod catalog;
pub mod event;
pub mod workflow;
