use serde::{Deserialize, Serialize};

bitflags::bitflags! {
	/// Connection kinds a broker client supports, advertised during the
	/// broker-protocol handshake.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
	#[serde(transparent)]
	pub struct SupportedConnections: u8 {
		const NONE = 0x00;
		const IPC_PIPE = 0x01;
		const MULTIPLEXING = 0x02;
		const LOCAL_ACTIVATION = 0x04;
	}
}

/// Description of the client's own service-hosting capabilities, used by
/// the remote side to decide whether it can offload a service to the
/// client for in-process activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHostInformation {
	pub operating_system: String,
	pub process_architecture: String,
	pub runtime: String,
	pub runtime_version: String,
}

impl ServiceHostInformation {
	/// Builds a description of the current process's host environment.
	#[must_use]
	pub fn current() -> Self {
		Self {
			operating_system: std::env::consts::OS.to_string(),
			process_architecture: std::env::consts::ARCH.to_string(),
			runtime: "rustc".to_string(),
			runtime_version: option_env!("CARGO_PKG_RUST_VERSION")
				.unwrap_or("unknown")
				.to_string(),
		}
	}
}

/// Metadata transmitted once per remote-broker connection in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBrokerClientMetadata {
	pub supported_connections: SupportedConnections,
	pub local_service_host: Option<ServiceHostInformation>,
}

impl ServiceBrokerClientMetadata {
	#[must_use]
	pub fn new(supported_connections: SupportedConnections) -> Self {
		Self {
			supported_connections,
			local_service_host: None,
		}
	}

	/// Returns a clone advertising in-process activation in addition to
	/// whatever was already supported (idempotent).
	#[must_use]
	pub fn offering_local_service_host(&self) -> Self {
		Self {
			supported_connections: self.supported_connections | SupportedConnections::LOCAL_ACTIVATION,
			local_service_host: Some(ServiceHostInformation::current()),
		}
	}
}
