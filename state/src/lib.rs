//! Stowage state backends
//!
//! An embedded SQLite engine and an external Redis client behind the
//! shared `StateBackend` trait, plus the `StateManager` facade that picks
//! one from configuration and runs the expiry sweeper.

pub mod embedded;
pub mod external;
pub mod manager;
pub mod pool;
pub mod retry;
pub mod sweeper;

pub use embedded::{remove_database_files, EmbeddedBackend};
pub use external::ExternalBackend;
pub use manager::{create_backend, StateManager};
pub use pool::ConnectionPool;
pub use retry::RetryPolicy;
pub use sweeper::Sweeper;
