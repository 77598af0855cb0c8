//! Fair lock arbitrated by a ticket registry.
//!
//! Competitors poll a [`TicketRegistry`] over HTTP with their [`plume_model::Ticket`]; the
//! registry elects the oldest live ticket and the elected competitor owns the lock until it ends
//! its work.

mod client;
mod locker;
mod registry;
mod server;

pub use client::RegistryClient;
pub use locker::{TicketLockConfig, TicketLocker};
pub use registry::{RegistryConfig, TicketRegistry};
pub use server::{RegistryServer, RegistryService};
