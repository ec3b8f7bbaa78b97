//! # parley-shared
//!
//! Vocabulary shared by every Parley crate: identifiers, domain models,
//! the push/REST wire protocol and protocol constants.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::ModelError;
