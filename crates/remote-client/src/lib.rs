//! Turns an `IRemoteServiceBroker` and an optional multiplexing stream into
//! an `IServiceBroker` (§4.7): connection-kind handshaking, per-request
//! dispatch across named pipes / multiplexing sub-channels / in-process
//! activation, and cancel-on-failure bookkeeping.

mod client;
mod local_activation;

pub use client::RemoteServiceBrokerClient;
pub use local_activation::LocalActivator;
