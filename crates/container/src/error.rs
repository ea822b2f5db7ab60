use brokerage_moniker::ServiceMoniker;

/// Errors raised by [`crate::ServiceContainer`] lookups.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContainerError {
	/// No registration exists for this moniker at all.
	#[error("{0} is not locally registered")]
	NotLocallyRegistered(ServiceMoniker),
	/// A registration exists but its audience mask does not include the
	/// requesting consumer, or the consumer is a guest and the
	/// registration has not opted in to guest access.
	#[error("{0} is not visible to this consumer's audience")]
	AudienceMismatch(ServiceMoniker),
	/// The registration's proffer callback for a source ran and failed.
	#[error("proffering {moniker} from a source failed: {reason}")]
	ProfferFailed { moniker: ServiceMoniker, reason: String },
}
