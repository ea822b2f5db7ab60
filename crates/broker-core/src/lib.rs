//! `IServiceBroker` / `IRemoteServiceBroker` contracts, error kinds, and the
//! broker aggregators that compose them.
//!
//! This crate does not know about IPC addresses, wire framing, or
//! authorization — it is the pure composition layer sitting between a
//! consumer and whatever transport ultimately produces a duplex pipe.

mod aggregators;
mod contracts;
mod error;
mod multiplexing;

pub use aggregators::{
	ForceMarshalAggregator, LazyAggregator, NonDisposableBroker, ParallelAtMostOneAggregator, SequentialAggregator,
};
pub use contracts::{
	forward_availability_changed, get_proxy, AvailabilityChangedSource, ProxyFactory, ProxyFactoryError,
	RemoteServiceBroker, ServiceBroker,
};
pub use error::BrokerError;
pub use multiplexing::{unwrap_multiplexing_stream, wrap_multiplexing_stream, MultiplexingStream};
