//! Exposes a process-local `IServiceBroker` as an `IRemoteServiceBroker`
//! over either named pipes (§4.8) or sub-channels of a shared
//! multiplexed stream (§4.9).

mod ipc;
mod multiplexing;
mod pump;

pub use ipc::IpcRelayBroker;
pub use multiplexing::MultiplexingRelayBroker;
