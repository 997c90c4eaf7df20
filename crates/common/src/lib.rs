//! Common types, engine boundary traits, and errors shared across
//! `fieldvault` crates.

pub mod encoding;
pub mod engine;
pub mod error;
pub mod keys;
pub mod schema;

pub use error::EngineError;
