use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a pending service-channel reservation on the remote side, so
/// the client can cancel it if it never connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRequestId(pub Uuid);

impl ServiceRequestId {
	/// Generates a fresh, random request id.
	#[must_use]
	pub fn new_random() -> Self {
		Self(Uuid::new_v4())
	}
}

/// Record describing an in-process service activation: a loadable library
/// and the symbol exporting its activation entry point.
///
/// This is the Rust analogue of a CLR-style "assembly path + type name"
/// record: instead of reflection, the client `dlopen`s `library_path` and
/// resolves `entry_symbol`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalActivationRecord {
	pub library_path: String,
	pub entry_symbol: String,
}

/// Response to a `request-service-channel` call.
///
/// Carries at most one connection instruction. When every field is `None`
/// the service is unavailable: no resources were reserved, and no cancel is
/// needed. When any instruction field is `Some` and the client will not
/// consume it, it must send `cancel-service-request(request_id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteServiceConnectionInfo {
	pub request_id: Option<ServiceRequestId>,
	pub pipe_name: Option<String>,
	pub multiplexing_channel_id: Option<u64>,
	pub local_activation: Option<LocalActivationRecord>,
}

impl RemoteServiceConnectionInfo {
	/// The empty instruction: service not found, nothing reserved.
	#[must_use]
	pub fn empty() -> Self {
		Self::default()
	}

	/// True when no connection instruction is present.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.pipe_name.is_none()
			&& self.multiplexing_channel_id.is_none()
			&& self.local_activation.is_none()
	}
}
