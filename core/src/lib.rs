//! Stowage Core Library
//! 
//! Core types, traits, and abstractions shared by every Stowage backend.
//! Collaborators depend on this crate for the error taxonomy and the
//! configuration surface; the storage engines live in `stowage-state`.

pub mod types;
pub mod traits;
pub mod error;
pub mod config;

pub use types::*;
pub use traits::*;
pub use error::*;
pub use config::*;
