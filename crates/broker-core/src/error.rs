use brokerage_moniker::ServiceMoniker;

/// Error kinds raised by broker contracts and aggregators.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
	/// Discovery or activation failed for a specific moniker, for a reason
	/// other than "service not found" (that case returns `Ok(None)`
	/// instead).
	#[error("service activation failed for {moniker}: {source}")]
	ServiceActivationFailed {
		moniker: ServiceMoniker,
		#[source]
		source: Box<BrokerError>,
	},
	/// Discovery or activation failed for a reason not attributable to a
	/// single moniker — e.g. the parallel aggregator's "too many services".
	#[error("service composition failed: {0}")]
	Composition(String),
	/// Handshake negotiation failure, or a connection-info with no
	/// instruction the caller's side can satisfy.
	#[error("not supported: {0}")]
	NotSupported(String),
	/// Current-user-only pipe ownership mismatch, or the authorization
	/// service denied a must-authorize call.
	#[error("unauthorized access")]
	Unauthorized,
	/// Cooperative cancellation. Always rethrown unwrapped, never wrapped in
	/// another variant.
	#[error("operation cancelled")]
	Cancelled,
	/// Aggregated failures from a disposable bag or a fan-out operation;
	/// callers can iterate `.0` for the individual causes.
	#[error("{} aggregate failure(s)", .0.len())]
	Aggregate(Vec<BrokerError>),
	#[error(transparent)]
	Ipc(#[from] brokerage_ipc::IpcError),
}

impl BrokerError {
	#[must_use]
	pub fn activation_failed(moniker: ServiceMoniker, source: BrokerError) -> Self {
		Self::ServiceActivationFailed {
			moniker,
			source: Box::new(source),
		}
	}

	/// Whether this failure is network/IO/dispose-during-shutdown in
	/// nature, and should be downgraded to `Ok(None)` by the remote
	/// client's graceful-aggregation policy (§7) rather than
	/// propagated to the caller.
	#[must_use]
	pub fn is_graceful_disconnect(&self) -> bool {
		matches!(self, Self::Ipc(_))
	}
}
