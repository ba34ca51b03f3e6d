//! Lambda Harness Workspace - end-to-end tests for the local invocation harness.
//!
//! This is a virtual package that provides workspace-level integration tests.
//! The actual functionality is provided by the workspace member crates:
//!
//! - `lambda-harness`: HTTP dispatch, queue polling and the invocation engine
//! - `lambda-harness-example`: Example handlers and the `local_harness` binary
