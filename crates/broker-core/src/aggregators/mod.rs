//! The five broker aggregators from §4.4: composable `ServiceBroker`
//! wrappers that fan requests out to inner brokers in different shapes.
//!
//! All of them preserve the availability-changed event by forwarding it
//! with themselves as the observable source, so a caller holding an
//! aggregator never needs a reference to the brokers it wraps.

mod force_marshal;
mod lazy;
mod non_disposable;
mod parallel_at_most_one;
mod sequential;

pub use force_marshal::ForceMarshalAggregator;
pub use lazy::LazyAggregator;
pub use non_disposable::NonDisposableBroker;
pub use parallel_at_most_one::ParallelAtMostOneAggregator;
pub use sequential::SequentialAggregator;
