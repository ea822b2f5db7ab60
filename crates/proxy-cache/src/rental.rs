use std::sync::Arc;

use crate::entry::CacheEntry;

/// A scope-bound handle that keeps a cached proxy pinned while it is alive.
///
/// Rentals are the only safe way to use a cached proxy across await
/// points; consumers must not dispose the proxy directly. Dropping the
/// rental releases it back to the cache, which disposes the underlying
/// proxy the moment every rental on an already-invalidated entry has been
/// released.
///
/// [`Rental::proxy`] is non-null iff the factory that built this entry
/// returned a matching service.
pub struct Rental<T> {
	pub(crate) proxy: Option<Arc<T>>,
	pub(crate) entry: Option<Arc<CacheEntry>>,
}

impl<T> Rental<T> {
	#[must_use]
	pub fn proxy(&self) -> Option<&Arc<T>> {
		self.proxy.as_ref()
	}

	pub(crate) fn empty() -> Self {
		Self {
			proxy: None,
			entry: None,
		}
	}
}

impl<T> Drop for Rental<T> {
	fn drop(&mut self) {
		let Some(entry) = self.entry.take() else {
			return;
		};
		if self.proxy.is_none() {
			// Nothing was ever rented for this handle (factory returned
			// `None`); there is no count to release.
			return;
		}
		if entry.release() {
			tokio::spawn(async move {
				if let Some(Some(erased)) = entry.proxy_cell.get() {
					if let Err(e) = erased.dispose().await {
						tracing::warn!(error = %e, "disposing stale rented proxy failed");
					}
				}
			});
		}
	}
}
