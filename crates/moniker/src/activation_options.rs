use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque, non-serializable handle to a local client RPC target — the
/// object the service may call back into, when the service is activated
/// in-process. Only meaningful for local activation; never sent on the
/// wire.
pub type ClientRpcTarget = Arc<dyn std::any::Any + Send + Sync>;

/// Opaque, non-serializable handle to a shared multiplexing stream,
/// threaded through activation options only between a relay and the final
/// broker it forwards to. Never sent on the wire.
pub type MultiplexingStreamHandle = Arc<dyn std::any::Any + Send + Sync>;

/// A serializable bag of per-request activation parameters.
///
/// Equality and `Clone` ignore the non-serializable `client_rpc_target` and
/// `multiplexing_stream` fields — they compare (and clone) as if absent,
/// matching the wire representation.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ServiceActivationOptions {
	/// Free-form activation arguments.
	pub activation_arguments: HashMap<String, String>,
	/// Client credentials to attach to the activation.
	pub client_credentials: HashMap<String, String>,
	/// Preferred culture (e.g. `"en-US"`).
	pub client_culture: Option<String>,
	/// Preferred UI culture.
	pub client_ui_culture: Option<String>,
	/// Local client RPC target, used only when the service is local.
	/// Never serialized.
	#[serde(skip)]
	pub client_rpc_target: Option<ClientRpcTarget>,
	/// Shared multiplexing stream, used only between a relay and a final
	/// broker. Never serialized.
	#[serde(skip)]
	pub multiplexing_stream: Option<MultiplexingStreamHandle>,
}

impl std::fmt::Debug for ServiceActivationOptions {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServiceActivationOptions")
			.field("activation_arguments", &self.activation_arguments)
			.field(
				"client_credentials",
				&self.client_credentials.keys().collect::<Vec<_>>(),
			)
			.field("client_culture", &self.client_culture)
			.field("client_ui_culture", &self.client_ui_culture)
			.field("client_rpc_target", &self.client_rpc_target.is_some())
			.field("multiplexing_stream", &self.multiplexing_stream.is_some())
			.finish()
	}
}

impl PartialEq for ServiceActivationOptions {
	fn eq(&self, other: &Self) -> bool {
		self.activation_arguments == other.activation_arguments
			&& self.client_credentials == other.client_credentials
			&& self.client_culture == other.client_culture
			&& self.client_ui_culture == other.client_ui_culture
	}
}

impl Eq for ServiceActivationOptions {}

impl ServiceActivationOptions {
	/// Returns a clone with `client_credentials` filled from `defaults` for
	/// any key not already present (used by the remote client when filling
	/// in authorization-derived credentials, and by the container's
	/// `request-overrides-default` policy).
	#[must_use]
	pub fn with_default_credentials(&self, defaults: &HashMap<String, String>) -> Self {
		let mut merged = self.clone();
		for (k, v) in defaults {
			merged
				.client_credentials
				.entry(k.clone())
				.or_insert_with(|| v.clone());
		}
		merged
	}

	/// Returns a clone whose credentials are unconditionally replaced by
	/// `overrides` (the container's `filter-overrides-request` policy).
	#[must_use]
	pub fn with_overridden_credentials(&self, overrides: HashMap<String, String>) -> Self {
		Self {
			client_credentials: overrides,
			..self.clone()
		}
	}
}
