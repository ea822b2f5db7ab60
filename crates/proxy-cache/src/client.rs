use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use brokerage_core::{get_proxy, BrokerError, ProxyFactory, ServiceBroker};
use brokerage_disposable::{AsyncDisposable, DisposeError};
use brokerage_moniker::{BrokeredServicesChangedEventArgs, ServiceActivationOptions, ServiceMoniker, ServiceRpcDescriptor};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::drain::{InvalidatedDrainer, InvalidatedHandler};
use crate::entry::{CacheEntry, ErasedProxy};
use crate::rental::Rental;

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
	moniker: ServiceMoniker,
	contract: TypeId,
}

/// Caches and shares proxies keyed by (moniker, contract-type), with
/// rental accounting and coherent invalidation driven by an inner
/// broker's availability-changed event (§4.5).
pub struct ServiceBrokerClient {
	inner: Arc<dyn ServiceBroker>,
	entries: Mutex<HashMap<CacheKey, Arc<CacheEntry>>>,
	invalidation_semaphore: Semaphore,
	drainer: InvalidatedDrainer,
	availability_forward: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ServiceBrokerClient {
	/// Builds a cache over `inner`, subscribing to its availability-changed
	/// event for the lifetime of the returned `Arc`.
	#[must_use]
	pub fn new(inner: Arc<dyn ServiceBroker>) -> Arc<Self> {
		let client = Arc::new(Self {
			inner: inner.clone(),
			entries: Mutex::new(HashMap::new()),
			invalidation_semaphore: Semaphore::new(1),
			drainer: InvalidatedDrainer::new(),
			availability_forward: Mutex::new(None),
		});

		let mut rx = inner.subscribe_availability_changed();
		let weak = Arc::downgrade(&client);
		let task = tokio::spawn(async move {
			loop {
				match rx.recv().await {
					Ok(args) => {
						let Some(client) = weak.upgrade() else { break };
						client.invalidate(args).await;
					}
					Err(RecvError::Lagged(_)) => continue,
					Err(RecvError::Closed) => break,
				}
			}
		});
		*client.availability_forward.lock().unwrap() = Some(task);
		client
	}

	/// Exposed so callers initializing derived state can serialize
	/// themselves against invalidations (§4.5).
	#[must_use]
	pub fn invalidation_semaphore(&self) -> &Semaphore {
		&self.invalidation_semaphore
	}

	/// Registers an async handler invoked whenever this cache's contents
	/// are invalidated. Handlers run on a worker, never on the caller's
	/// task, never inlined under the cache's internal lock, and never
	/// concurrently with the previous batch of handlers.
	pub fn subscribe_invalidated<F, Fut>(&self, handler: F)
	where
		F: Fn(BrokeredServicesChangedEventArgs, CancellationToken) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let boxed: InvalidatedHandler = Arc::new(move |args, cancel| Box::pin(handler(args, cancel)));
		self.drainer.subscribe(boxed);
	}

	/// Returns a rental pinning the cached proxy for `descriptor`'s
	/// moniker and contract type `T`, constructing it via `factory` on
	/// first access. Concurrent calls for the same key while the entry is
	/// current share the same underlying proxy.
	pub async fn get_proxy<T>(
		&self,
		descriptor: &ServiceRpcDescriptor,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
		factory: &dyn ProxyFactory<T>,
	) -> Result<Rental<T>, BrokerError>
	where
		T: AsyncDisposable + Send + Sync + 'static,
	{
		let key = CacheKey {
			moniker: descriptor.moniker().clone(),
			contract: TypeId::of::<T>(),
		};
		let entry = {
			let mut entries = self.entries.lock().unwrap();
			entries.entry(key).or_insert_with(|| Arc::new(CacheEntry::new())).clone()
		};

		let moniker = descriptor.moniker().clone();
		let broker = self.inner.clone();
		let constructed = entry
			.proxy_cell
			.get_or_try_init(|| async {
				match get_proxy(broker.as_ref(), &moniker, options, cancel, factory).await {
					Ok(Some(proxy)) => Ok(Some(ErasedProxy::new(Arc::new(proxy)))),
					Ok(None) => Ok(None),
					Err(e) => Err(e),
				}
			})
			.await?;

		let Some(erased) = constructed else {
			return Ok(Rental::empty());
		};

		entry.rent();
		let proxy = erased
			.value
			.clone()
			.downcast::<T>()
			.expect("cache entry keyed by TypeId always holds its own contract type");

		Ok(Rental {
			proxy: Some(proxy),
			entry: Some(entry),
		})
	}

	/// Removes every cache entry impacted by `args`. An entry with
	/// outstanding rentals is marked stale instead of disposed immediately;
	/// its proxy is disposed by the last `Rental` to release it
	/// ([`CacheEntry::release`]).
	pub async fn invalidate(&self, args: BrokeredServicesChangedEventArgs) {
		let mut to_dispose = Vec::new();
		{
			let mut entries = self.entries.lock().unwrap();
			entries.retain(|key, entry| {
				if !args.impacts(&key.moniker) {
					return true;
				}
				if entry.rental_count() > 0 {
					entry.mark_stale();
				} else if matches!(entry.proxy_cell.get(), Some(Some(_))) {
					to_dispose.push(entry.clone());
				}
				false
			});
		}

		for entry in to_dispose {
			if let Some(Some(erased)) = entry.proxy_cell.get() {
				if let Err(e) = erased.dispose().await {
					tracing::warn!(error = %e, "disposing invalidated cached proxy failed");
				}
			}
		}

		self.drainer.raise(args).await;
	}
}

#[async_trait]
impl AsyncDisposable for ServiceBrokerClient {
	async fn dispose(&self) -> Result<(), DisposeError> {
		if let Some(task) = self.availability_forward.lock().unwrap().take() {
			task.abort();
		}
		self.invalidate(BrokeredServicesChangedEventArgs::all_impacted()).await;
		self.drainer.shutdown().await;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use brokerage_core::ProxyFactoryError;
	use brokerage_ipc::DuplexPipe;
	use brokerage_moniker::ServiceRpcDescriptor;
	use tokio::sync::broadcast;

	use super::*;

	struct StubBroker {
		availability: broadcast::Sender<BrokeredServicesChangedEventArgs>,
	}

	impl StubBroker {
		fn new() -> (Arc<Self>, broadcast::Sender<BrokeredServicesChangedEventArgs>) {
			let (tx, _rx) = broadcast::channel(16);
			(Arc::new(Self { availability: tx.clone() }), tx)
		}
	}

	#[async_trait]
	impl ServiceBroker for StubBroker {
		async fn get_pipe(
			&self,
			_moniker: &ServiceMoniker,
			_options: ServiceActivationOptions,
			_cancel: CancellationToken,
		) -> Result<Option<DuplexPipe>, BrokerError> {
			let (client, server) = tokio::io::duplex(64);
			drop(server);
			Ok(Some(Box::new(client)))
		}

		fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs> {
			self.availability.subscribe()
		}
	}

	struct CountingProxy {
		id: usize,
		disposals: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl AsyncDisposable for CountingProxy {
		async fn dispose(&self) -> Result<(), DisposeError> {
			self.disposals.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	struct CountingFactory {
		next_id: AtomicUsize,
		disposals: Arc<AtomicUsize>,
	}

	impl ProxyFactory<CountingProxy> for CountingFactory {
		fn create_proxy(&self, _pipe: DuplexPipe) -> Result<CountingProxy, ProxyFactoryError> {
			let id = self.next_id.fetch_add(1, Ordering::SeqCst);
			Ok(CountingProxy {
				id,
				disposals: self.disposals.clone(),
			})
		}
	}

	fn descriptor() -> ServiceRpcDescriptor {
		ServiceRpcDescriptor::json_rpc(ServiceMoniker::new("calc"))
	}

	#[tokio::test]
	async fn concurrent_get_proxy_share_the_same_instance() {
		let (broker, _tx) = StubBroker::new();
		let cache = ServiceBrokerClient::new(broker);
		let disposals = Arc::new(AtomicUsize::new(0));
		let factory = CountingFactory {
			next_id: AtomicUsize::new(0),
			disposals: disposals.clone(),
		};

		let (a, b) = tokio::join!(
			cache.get_proxy(&descriptor(), ServiceActivationOptions::default(), CancellationToken::new(), &factory),
			cache.get_proxy(&descriptor(), ServiceActivationOptions::default(), CancellationToken::new(), &factory),
		);
		let a = a.unwrap();
		let b = b.unwrap();
		assert_eq!(a.proxy().unwrap().id, b.proxy().unwrap().id);
	}

	#[tokio::test]
	async fn invalidation_disposes_unrented_entry_immediately() {
		let (broker, tx) = StubBroker::new();
		let cache = ServiceBrokerClient::new(broker);
		let disposals = Arc::new(AtomicUsize::new(0));
		let factory = CountingFactory {
			next_id: AtomicUsize::new(0),
			disposals: disposals.clone(),
		};

		let rental = cache
			.get_proxy(&descriptor(), ServiceActivationOptions::default(), CancellationToken::new(), &factory)
			.await
			.unwrap();
		drop(rental);

		tx.send(BrokeredServicesChangedEventArgs::for_monikers([ServiceMoniker::new("calc")]))
			.unwrap();
		// Give the forwarding task and invalidation a turn to run.
		for _ in 0..100 {
			if disposals.load(Ordering::SeqCst) == 1 {
				break;
			}
			tokio::task::yield_now().await;
		}
		assert_eq!(disposals.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn rental_released_after_invalidation_disposes_exactly_once() {
		let (broker, tx) = StubBroker::new();
		let cache = ServiceBrokerClient::new(broker);
		let disposals = Arc::new(AtomicUsize::new(0));
		let factory = CountingFactory {
			next_id: AtomicUsize::new(0),
			disposals: disposals.clone(),
		};

		let rental = cache
			.get_proxy(&descriptor(), ServiceActivationOptions::default(), CancellationToken::new(), &factory)
			.await
			.unwrap();

		tx.send(BrokeredServicesChangedEventArgs::for_monikers([ServiceMoniker::new("calc")]))
			.unwrap();
		for _ in 0..100 {
			tokio::task::yield_now().await;
		}
		assert_eq!(disposals.load(Ordering::SeqCst), 0, "rental still held, must not dispose yet");

		drop(rental);
		for _ in 0..100 {
			if disposals.load(Ordering::SeqCst) == 1 {
				break;
			}
			tokio::task::yield_now().await;
		}
		assert_eq!(disposals.load(Ordering::SeqCst), 1);
	}
}
