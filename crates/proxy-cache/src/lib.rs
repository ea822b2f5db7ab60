//! `ServiceBrokerClient`: a rental-counted cache mapping (service identity,
//! proxy contract type) to a lazily constructed proxy, with coherent
//! invalidation on availability change (§4.5).

mod client;
mod drain;
mod entry;
mod rental;

pub use client::ServiceBrokerClient;
pub use rental::Rental;
