//! Stowage command line support

pub mod commands;

pub use commands::*;
