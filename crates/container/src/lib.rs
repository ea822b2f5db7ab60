//! Process-local registry of proffered services, audience-checked and
//! memoized per source (§4.10 — a secondary, TS-originated surface kept
//! for the same consumers as the rest of the core).
//!
//! This is the layer above [`brokerage_core::ServiceBroker`]: where the
//! broker contracts and aggregators compose already-acquired brokers, the
//! container is how a host first decides *which* broker may answer a given
//! moniker for a given consumer.

mod audience;
mod container;
mod credentials_policy;
mod error;
mod registration;

pub use audience::{Audience, Consumer};
pub use container::ServiceContainer;
pub use credentials_policy::ClientCredentialsPolicy;
pub use error::ContainerError;
pub use registration::{ProfferFactory, Registration, Source};
