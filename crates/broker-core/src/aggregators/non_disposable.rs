use std::sync::Arc;

use async_trait::async_trait;
use brokerage_ipc::DuplexPipe;
use brokerage_moniker::{BrokeredServicesChangedEventArgs, ServiceActivationOptions, ServiceMoniker};
use tokio_util::sync::CancellationToken;

use crate::contracts::{forward_availability_changed, AvailabilityChangedSource, ServiceBroker};
use crate::error::BrokerError;

/// A pass-through wrapper that intentionally does not implement
/// `AsyncDisposable`, so that recipients sharing this handle cannot
/// shorten the inner broker's lifetime by disposing it out from under
/// other holders.
///
/// Still forwards availability-changed with itself as sender, like every
/// other aggregator in this module (§4.4): the forwarding task simply runs
/// until `inner`'s event source is dropped, since there is no `dispose` to
/// abort it early.
pub struct NonDisposableBroker {
	inner: Arc<dyn ServiceBroker>,
	availability: AvailabilityChangedSource,
	_forward_task: tokio::task::JoinHandle<()>,
}

impl NonDisposableBroker {
	#[must_use]
	pub fn new(inner: Arc<dyn ServiceBroker>) -> Self {
		let availability = AvailabilityChangedSource::new();
		let forward_task = forward_availability_changed(inner.subscribe_availability_changed(), availability.clone());
		Self {
			inner,
			availability,
			_forward_task: forward_task,
		}
	}
}

#[async_trait]
impl ServiceBroker for NonDisposableBroker {
	async fn get_pipe(
		&self,
		moniker: &ServiceMoniker,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<Option<DuplexPipe>, BrokerError> {
		self.inner.get_pipe(moniker, options, cancel).await
	}

	fn subscribe_availability_changed(&self) -> tokio::sync::broadcast::Receiver<BrokeredServicesChangedEventArgs> {
		self.availability.subscribe()
	}
}
