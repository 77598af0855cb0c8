//! Data model shared by the plume schedulers and lockers.
//!
//! Everything here is plain serde data: it crosses process boundaries through task files,
//! and crosses hosts through the ticket registry.

mod domain;
pub use domain::*;

mod lock;
pub use lock::Ticket;

mod error;
pub use error::ModelError;
