use std::sync::Arc;

use async_trait::async_trait;
use brokerage_disposable::{AsyncDisposable, DisposeError};
use brokerage_ipc::DuplexPipe;
use brokerage_moniker::{BrokeredServicesChangedEventArgs, ServiceActivationOptions, ServiceMoniker};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::contracts::{forward_availability_changed, AvailabilityChangedSource, ServiceBroker};
use crate::error::BrokerError;

/// Fans out concurrently to every inner broker. If more than one returns a
/// non-null result, all of them are shut down and the call fails with a
/// "too many services" composition error — tie-breaking is by cardinality
/// only, never by broker ordering.
pub struct ParallelAtMostOneAggregator {
	inner: Vec<Arc<dyn ServiceBroker>>,
	availability: AvailabilityChangedSource,
	forward_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ParallelAtMostOneAggregator {
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
impl ServiceBroker for ParallelAtMostOneAggregator {
	async fn get_pipe(
		&self,
		moniker: &ServiceMoniker,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<Option<DuplexPipe>, BrokerError> {
		let mut set = JoinSet::new();
		for broker in self.inner.iter().cloned() {
			let moniker = moniker.clone();
			let options = options.clone();
			let cancel = cancel.clone();
			set.spawn(async move { broker.get_pipe(&moniker, options, cancel).await });
		}

		let mut results = Vec::new();
		while let Some(joined) = set.join_next().await {
			match joined {
				Ok(Ok(Some(pipe))) => results.push(pipe),
				Ok(Ok(None)) => {}
				Ok(Err(err)) => {
					for mut pipe in results {
						let _ = pipe.shutdown().await;
					}
					return Err(err);
				}
				Err(join_err) => {
					if join_err.is_panic() {
						std::panic::resume_unwind(join_err.into_panic());
					}
					// Task was aborted (e.g. the aggregator itself was
					// disposed mid-call); treat as "no result" from that
					// broker.
				}
			}
		}

		match results.len() {
			0 => Ok(None),
			1 => Ok(results.pop()),
			_ => {
				for mut pipe in results {
					let _ = pipe.shutdown().await;
				}
				Err(BrokerError::Composition("too many services".to_string()))
			}
		}
	}

	fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs> {
		self.availability.subscribe()
	}
}

#[async_trait]
impl AsyncDisposable for ParallelAtMostOneAggregator {
	async fn dispose(&self) -> Result<(), DisposeError> {
		let tasks = std::mem::take(&mut *self.forward_tasks.lock().await);
		for task in tasks {
			task.abort();
		}
		Ok(())
	}
}
