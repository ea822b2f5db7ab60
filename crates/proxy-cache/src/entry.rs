use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use brokerage_disposable::{AsyncDisposable, DisposeError};
use tokio::sync::OnceCell;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A cached proxy with its concrete type erased to `dyn Any`, paired with a
/// thunk that knows how to call the concrete type's
/// `AsyncDisposable::dispose` without the cache itself needing to be
/// generic over every cached contract type at once.
pub(crate) struct ErasedProxy {
	pub(crate) value: Arc<dyn Any + Send + Sync>,
	dispose: Arc<dyn Fn() -> BoxFuture<Result<(), DisposeError>> + Send + Sync>,
}

impl ErasedProxy {
	pub(crate) fn new<T>(proxy: Arc<T>) -> Self
	where
		T: AsyncDisposable + Send + Sync + 'static,
	{
		let dispose_target = proxy.clone();
		Self {
			value: proxy,
			dispose: Arc::new(move || {
				let target = dispose_target.clone();
				Box::pin(async move { target.dispose().await })
			}),
		}
	}

	pub(crate) async fn dispose(&self) -> Result<(), DisposeError> {
		(self.dispose)().await
	}
}

/// One cache slot: a lazily constructed proxy shared by every concurrent
/// `get_proxy` call for the same (moniker, contract-type) key, plus its
/// rental bookkeeping.
///
/// `rental_count` and `stale` together replace a pair of separate
/// `rented-proxies`/`stale-rented-proxies` maps: since every entry
/// already carries its own count, keying a second map on the entry itself
/// would only duplicate that state under a different lookup.
pub(crate) struct CacheEntry {
	pub(crate) proxy_cell: OnceCell<Option<ErasedProxy>>,
	rental_count: AtomicUsize,
	stale: AtomicBool,
}

impl CacheEntry {
	pub(crate) fn new() -> Self {
		Self {
			proxy_cell: OnceCell::new(),
			rental_count: AtomicUsize::new(0),
			stale: AtomicBool::new(false),
		}
	}

	pub(crate) fn rent(&self) {
		self.rental_count.fetch_add(1, Ordering::AcqRel);
	}

	pub(crate) fn rental_count(&self) -> usize {
		self.rental_count.load(Ordering::Acquire)
	}

	pub(crate) fn mark_stale(&self) {
		self.stale.store(true, Ordering::Release);
	}

	pub(crate) fn is_stale(&self) -> bool {
		self.stale.load(Ordering::Acquire)
	}

	/// Decrements the rental count. Returns `true` exactly when this was
	/// the last outstanding rental on an entry already marked stale — the
	/// one moment the caller must dispose the cached proxy.
	pub(crate) fn release(&self) -> bool {
		let previous = self.rental_count.fetch_sub(1, Ordering::AcqRel);
		previous == 1 && self.is_stale()
	}
}
