use brokerage_core::BrokerError;
use brokerage_moniker::{LocalActivationRecord, ServiceActivationOptions};

/// The out-of-scope in-process activation collaborator: given the library
/// path and entry symbol a remote side advertised, produces a typed proxy
/// without ever opening a pipe. `get_pipe` cannot represent this outcome at
/// all; only [`super::RemoteServiceBrokerClient::get_proxy`] consults it.
pub trait LocalActivator<T>: Send + Sync {
	fn activate(&self, record: &LocalActivationRecord, options: &ServiceActivationOptions) -> Result<T, BrokerError>;
}
