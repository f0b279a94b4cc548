//! Integration test suite for Foreman.
//!
//! These tests wire the task board, contract analyzer, execution pipeline
//! and monitor over a temporary git workspace and verify that they work
//! together correctly.
//!
//! # Test Categories
//!
//! - `execution`: Execution passes from plan to commit
//! - `monitor`: Reactor idempotence, kickoff and periodic sweeps
//! - `contract_flow`: Contract publication and downstream blocking
//!
//! # CI Compatibility
//!
//! Completions are scripted and package-manager commands are faked, so
//! no model binary, node or network access is needed. Git runs for real.

mod fixtures;

mod contract_flow;
mod execution;
mod monitor;
