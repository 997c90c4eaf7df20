//! In-memory document store and encryption engine.
//!
//! Implements the boundary traits from `common` entirely in process, with
//! the behaviours the key-lifecycle layer depends on: unique partial indexes
//! on the key registry, wrapped data keys, deterministic ciphertext that
//! answers equality queries, and encrypted collections whose field metadata
//! survives in the store catalog. Intended for tests and demos; the wire
//! formats are real, the durability is not.

pub mod cipher;
pub mod engine;
pub mod store;

pub use engine::{MemoryEngine, MemoryEngineBuilder};
pub use store::{MemoryHandle, MemoryStore};
