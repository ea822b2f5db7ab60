use std::sync::Arc;

use async_trait::async_trait;
use brokerage_disposable::{AsyncDisposable, DisposeError};
use brokerage_ipc::DuplexPipe;
use brokerage_moniker::{BrokeredServicesChangedEventArgs, ServiceActivationOptions, ServiceMoniker};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::contracts::{forward_availability_changed, get_proxy, AvailabilityChangedSource, ProxyFactory, ServiceBroker};
use crate::error::BrokerError;

/// Re-routes `get-proxy` through the inner broker's `get-pipe`, forcing the
/// result to use the wire protocol even where `ServiceBroker` in this crate
/// already always marshals over a pipe. Its distinct contribution is
/// ensuring a proxy-construction failure that happens *after* pipe
/// acquisition tears the pipe back down rather than leaking it — see
/// [`get_proxy`], which this forwards to unchanged.
pub struct ForceMarshalAggregator {
	inner: Arc<dyn ServiceBroker>,
	availability: AvailabilityChangedSource,
	forward_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ForceMarshalAggregator {
	#[must_use]
	pub fn new(inner: Arc<dyn ServiceBroker>) -> Self {
		let availability = AvailabilityChangedSource::new();
		let forward_task = forward_availability_changed(inner.subscribe_availability_changed(), availability.clone());
		Self {
			inner,
			availability,
			forward_task: Mutex::new(Some(forward_task)),
		}
	}

	/// Requests a typed proxy, always marshaled over `inner`'s pipe.
	/// Returns `Ok(None)` if the inner broker has no matching service.
	pub async fn get_proxy<T>(
		&self,
		moniker: &ServiceMoniker,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
		factory: &dyn ProxyFactory<T>,
	) -> Result<Option<T>, BrokerError> {
		get_proxy(self.inner.as_ref(), moniker, options, cancel, factory).await
	}
}

#[async_trait]
impl ServiceBroker for ForceMarshalAggregator {
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

#[async_trait]
impl AsyncDisposable for ForceMarshalAggregator {
	/// Unsubscribes the forwarded event hook. Does not dispose the inner
	/// broker — it is borrowed, not owned.
	async fn dispose(&self) -> Result<(), DisposeError> {
		if let Some(task) = self.forward_task.lock().await.take() {
			task.abort();
		}
		Ok(())
	}
}
