//! Service identity, descriptors, activation options and wire types shared
//! across the brokered-service framework.

mod activation_options;
mod client_metadata;
mod connection_info;
mod descriptor;
mod events;
mod moniker;
mod protected_operation;

pub use activation_options::{ClientRpcTarget, MultiplexingStreamHandle, ServiceActivationOptions};
pub use client_metadata::{
	ServiceBrokerClientMetadata, ServiceHostInformation, SupportedConnections,
};
pub use connection_info::{LocalActivationRecord, RemoteServiceConnectionInfo, ServiceRequestId};
pub use descriptor::{DescriptorError, Formatter, Framing, MultiplexingOptions, ServiceRpcDescriptor};
pub use events::BrokeredServicesChangedEventArgs;
pub use moniker::{EmptyMonikerName, ServiceMoniker};
pub use protected_operation::ProtectedOperation;
