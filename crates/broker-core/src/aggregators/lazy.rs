use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use brokerage_disposable::{AsyncDisposable, DisposeError};
use brokerage_ipc::DuplexPipe;
use brokerage_moniker::{BrokeredServicesChangedEventArgs, ServiceActivationOptions, ServiceMoniker};
use tokio::sync::{broadcast, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::contracts::{forward_availability_changed, AvailabilityChangedSource, ServiceBroker};
use crate::error::BrokerError;

type ConstructBroker =
	Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<Arc<dyn ServiceBroker>, BrokerError>> + Send>> + Send>;

/// Defers construction of the inner broker until the first request.
///
/// Construction is guarded by an async-once cell: concurrent callers
/// racing the first request all await the same in-flight construction.
/// Disposal unsubscribes the forwarded event handler even if construction
/// is still in flight — a disposed-before-construction-completes aggregator
/// simply never wires up forwarding once construction finishes.
pub struct LazyAggregator {
	factory: Mutex<Option<ConstructBroker>>,
	inner: OnceCell<Arc<dyn ServiceBroker>>,
	/// Cached message from a prior failed construction attempt. `OnceCell`
	/// retries its init closure on every call after a failure, but our
	/// factory is `FnOnce` and already consumed — this lets a retry report
	/// the same failure instead of panicking.
	construction_error: Mutex<Option<String>>,
	availability: AvailabilityChangedSource,
	forward_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
	disposed: AtomicBool,
}

impl LazyAggregator {
	pub fn new<F, Fut>(factory: F) -> Self
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = Result<Arc<dyn ServiceBroker>, BrokerError>> + Send + 'static,
	{
		let boxed: ConstructBroker = Box::new(move || Box::pin(factory()));
		Self {
			factory: Mutex::new(Some(boxed)),
			inner: OnceCell::new(),
			construction_error: Mutex::new(None),
			availability: AvailabilityChangedSource::new(),
			forward_task: Mutex::new(None),
			disposed: AtomicBool::new(false),
		}
	}

	async fn inner(&self) -> Result<&Arc<dyn ServiceBroker>, BrokerError> {
		if let Some(msg) = self.construction_error.lock().await.clone() {
			return Err(BrokerError::Composition(msg));
		}

		self.inner
			.get_or_try_init(|| async {
				let Some(factory) = self.factory.lock().await.take() else {
					let msg = self
						.construction_error
						.lock()
						.await
						.clone()
						.unwrap_or_else(|| "lazy aggregator construction already failed".to_string());
					return Err(BrokerError::Composition(msg));
				};
				match factory().await {
					Ok(broker) => {
						if !self.disposed.load(Ordering::SeqCst) {
							let task =
								forward_availability_changed(broker.subscribe_availability_changed(), self.availability.clone());
							*self.forward_task.lock().await = Some(task);
						}
						Ok(broker)
					}
					Err(err) => {
						*self.construction_error.lock().await = Some(err.to_string());
						Err(err)
					}
				}
			})
			.await
	}
}

#[async_trait]
impl ServiceBroker for LazyAggregator {
	async fn get_pipe(
		&self,
		moniker: &ServiceMoniker,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<Option<DuplexPipe>, BrokerError> {
		let broker = self.inner().await?.clone();
		broker.get_pipe(moniker, options, cancel).await
	}

	fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs> {
		self.availability.subscribe()
	}
}

#[async_trait]
impl AsyncDisposable for LazyAggregator {
	async fn dispose(&self) -> Result<(), DisposeError> {
		self.disposed.store(true, Ordering::SeqCst);
		if let Some(task) = self.forward_task.lock().await.take() {
			task.abort();
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	struct StubBroker;

	#[async_trait]
	impl ServiceBroker for StubBroker {
		async fn get_pipe(
			&self,
			_moniker: &ServiceMoniker,
			_options: ServiceActivationOptions,
			_cancel: CancellationToken,
		) -> Result<Option<DuplexPipe>, BrokerError> {
			Ok(None)
		}

		fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs> {
			AvailabilityChangedSource::new().subscribe()
		}
	}

	#[tokio::test]
	async fn construction_runs_exactly_once_across_concurrent_callers() {
		let construct_count = Arc::new(AtomicUsize::new(0));
		let counter = construct_count.clone();
		let aggregate = Arc::new(LazyAggregator::new(move || {
			let counter = counter.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Ok(Arc::new(StubBroker) as Arc<dyn ServiceBroker>)
			}
		}));

		let a = aggregate.clone();
		let b = aggregate.clone();
		let (ra, rb) = tokio::join!(
			a.get_pipe(&ServiceMoniker::new("calc"), ServiceActivationOptions::default(), CancellationToken::new()),
			b.get_pipe(&ServiceMoniker::new("calc"), ServiceActivationOptions::default(), CancellationToken::new()),
		);

		ra.unwrap();
		rb.unwrap();
		assert_eq!(construct_count.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn construction_failure_propagates_and_does_not_poison_forever() {
		let attempts = Arc::new(AtomicUsize::new(0));
		let counter = attempts.clone();
		let aggregate = LazyAggregator::new(move || {
			let counter = counter.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Err(BrokerError::Composition("boom".to_string()))
			}
		});

		let err = aggregate
			.get_pipe(&ServiceMoniker::new("calc"), ServiceActivationOptions::default(), CancellationToken::new())
			.await
			.unwrap_err();
		assert!(matches!(err, BrokerError::Composition(_)));
	}
}
