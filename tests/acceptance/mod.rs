//! Integration tests for rt-pacer acceptance testing.
//!
//! Unprivileged tests run on any Linux host with generous timing bounds.
//! Privileged tests check tight jitter criteria and are ignored by default.

mod common;
mod pacing_test;
mod thread_test;
