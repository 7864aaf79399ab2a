//! Utilities for testing group messaging functionality. They are used for
//!  testing this crate itself, but they are also exported so embedding
//!  applications can drive a node in their own tests.

pub mod message;
pub mod node;
