//! Bidcraft shared crate
//!
//! Small pieces used by more than one workspace member: database pool
//! construction, embedded migrations, and cross-crate billing vocabulary.

mod db;
mod types;

pub use db::{create_pool, run_migrations};
pub use types::{AccountRole, BillingStatus};
