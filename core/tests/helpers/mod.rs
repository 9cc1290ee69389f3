//! Test helper modules for integration tests
#![allow(dead_code, clippy::unwrap_used)]

pub mod collection;

pub use collection::*;
