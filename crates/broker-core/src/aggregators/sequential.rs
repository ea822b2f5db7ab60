use std::sync::Arc;

use async_trait::async_trait;
use brokerage_disposable::{AsyncDisposable, DisposeError};
use brokerage_moniker::{BrokeredServicesChangedEventArgs, ServiceActivationOptions, ServiceMoniker};
use brokerage_ipc::DuplexPipe;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::contracts::{forward_availability_changed, AvailabilityChangedSource, ServiceBroker};
use crate::error::BrokerError;

/// Tries inner brokers in order, returning the first non-null result.
///
/// No composition failure if every broker returns `None` — the aggregate
/// simply returns `None` too.
pub struct SequentialAggregator {
	inner: Vec<Arc<dyn ServiceBroker>>,
	availability: AvailabilityChangedSource,
	forward_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SequentialAggregator {
	#[must_use]
	pub fn new(inner: Vec<Arc<dyn ServiceBroker>>) -> Self {
		let availability = AvailabilityChangedSource::new();
		let forward_tasks = inner
			.iter()
			.map(|broker| forward_availability_changed(broker.subscribe_availability_changed(), availability.clone()))
			.collect();
		Self {
			inner,
			availability,
			forward_tasks: Mutex::new(forward_tasks),
		}
	}
}

#[async_trait]
impl ServiceBroker for SequentialAggregator {
	async fn get_pipe(
		&self,
		moniker: &ServiceMoniker,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<Option<DuplexPipe>, BrokerError> {
		for broker in &self.inner {
			if let Some(pipe) = broker.get_pipe(moniker, options.clone(), cancel.clone()).await? {
				return Ok(Some(pipe));
			}
		}
		Ok(None)
	}

	fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs> {
		self.availability.subscribe()
	}
}

#[async_trait]
impl AsyncDisposable for SequentialAggregator {
	/// Unsubscribes all forwarded event hooks. Does not dispose the inner
	/// brokers themselves — they are borrowed, not owned (spec's ownership
	/// model: "aggregators may hold a list but do not own the elements").
	async fn dispose(&self) -> Result<(), DisposeError> {
		let tasks = std::mem::take(&mut *self.forward_tasks.lock().await);
		for task in tasks {
			task.abort();
		}
		Ok(())
	}
}
