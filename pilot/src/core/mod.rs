//! Deterministic, pure logic shared by the agent core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod blocks;
pub mod path;
pub mod placeholders;
pub mod protocol;
pub mod retry;
pub mod types;
pub mod verify;
