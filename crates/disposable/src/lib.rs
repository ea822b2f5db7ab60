//! One-shot ownership of an ordered collection of disposable resources.
//!
//! [`DisposableBag`] is the primitive the rest of the core uses for
//! failure-unwind: anything that needs to be torn down together (a spawned
//! server instance, a forwarded event subscription, a pending pipe) is added
//! to a bag, and a single `dispose` call tears everything down in insertion
//! order, aggregating whatever errors individual disposals raise instead of
//! stopping at the first one.

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// A resource that can be asynchronously torn down.
#[async_trait]
pub trait AsyncDisposable: Send + Sync {
	/// Tears the resource down. Implementations should not panic; any
	/// failure should be reported through the `Err` case so the owning bag
	/// can aggregate it.
	async fn dispose(&self) -> Result<(), DisposeError>;
}

/// Error surfaced by a single [`AsyncDisposable::dispose`] call.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DisposeError(pub String);

impl DisposeError {
	pub fn new(msg: impl Into<String>) -> Self {
		Self(msg.into())
	}
}

/// Aggregate of every error raised while disposing a bag's members.
///
/// Disposal of each member is attempted regardless of earlier failures;
/// this is the composite surfaced to the caller afterward.
#[derive(Debug, Error, Default)]
pub struct AggregateDisposeError {
	errors: Vec<DisposeError>,
}

impl AggregateDisposeError {
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.errors.is_empty()
	}

	/// The individual failures, in the order their disposals were attempted.
	pub fn errors(&self) -> &[DisposeError] {
		&self.errors
	}

	/// Converts to `Result`: `Ok(())` if no disposal failed.
	pub fn into_result(self) -> Result<(), Self> {
		if self.is_empty() { Ok(()) } else { Err(self) }
	}
}

impl fmt::Display for AggregateDisposeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} disposal failure(s): ", self.errors.len())?;
		for (i, e) in self.errors.iter().enumerate() {
			if i > 0 {
				write!(f, "; ")?;
			}
			write!(f, "{e}")?;
		}
		Ok(())
	}
}

enum BagState {
	Open(Vec<Box<dyn AsyncDisposable>>),
	Disposed,
}

/// Thread-safe, one-shot collection of owned [`AsyncDisposable`]s.
///
/// Every resource added before [`DisposableBag::dispose`] is called is
/// disposed exactly once, in insertion order, even if `dispose` races with
/// concurrent `add` calls — a single mutex guards the open/disposed
/// transition so the two can never interleave unsafely.
pub struct DisposableBag {
	state: Mutex<BagState>,
}

impl Default for DisposableBag {
	fn default() -> Self {
		Self::new()
	}
}

impl DisposableBag {
	#[must_use]
	pub fn new() -> Self {
		Self {
			state: Mutex::new(BagState::Open(Vec::new())),
		}
	}

	/// Adds `item` to the bag. If the bag has already been disposed, `item`
	/// is disposed immediately instead (fire-and-forget: failures are
	/// logged, not surfaced, since there is no caller left to report to).
	pub fn add(&self, item: Box<dyn AsyncDisposable>) {
		let mut state = self.state.lock().unwrap();
		match &mut *state {
			BagState::Open(items) => items.push(item),
			BagState::Disposed => {
				drop(state);
				tokio::spawn(async move {
					if let Err(e) = item.dispose().await {
						tracing::warn!(error = %e, "disposing item added after bag disposal failed");
					}
				});
			}
		}
	}

	/// Like [`DisposableBag::add`], but never disposes `item` on the
	/// caller's behalf: if the bag is already disposed, `item` is returned
	/// so the caller can fall through to an alternate path.
	pub fn try_add(&self, item: Box<dyn AsyncDisposable>) -> Result<(), Box<dyn AsyncDisposable>> {
		let mut state = self.state.lock().unwrap();
		match &mut *state {
			BagState::Open(items) => {
				items.push(item);
				Ok(())
			}
			BagState::Disposed => Err(item),
		}
	}

	/// Transitions the bag to disposed and disposes every member in
	/// insertion order. Idempotent: calling this more than once (or
	/// concurrently) disposes the snapshot exactly once; later callers see
	/// an already-empty bag and return `Ok(())`.
	pub async fn dispose(&self) -> Result<(), AggregateDisposeError> {
		let items = {
			let mut state = self.state.lock().unwrap();
			match std::mem::replace(&mut *state, BagState::Disposed) {
				BagState::Open(items) => items,
				BagState::Disposed => Vec::new(),
			}
		};

		let mut errors = Vec::new();
		for item in items {
			if let Err(e) = item.dispose().await {
				errors.push(e);
			}
		}
		AggregateDisposeError { errors }.into_result()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	struct CountingDisposable {
		counter: Arc<AtomicUsize>,
		fail: bool,
	}

	#[async_trait]
	impl AsyncDisposable for CountingDisposable {
		async fn dispose(&self) -> Result<(), DisposeError> {
			self.counter.fetch_add(1, Ordering::SeqCst);
			if self.fail {
				Err(DisposeError::new("boom"))
			} else {
				Ok(())
			}
		}
	}

	#[tokio::test]
	async fn each_added_resource_disposed_exactly_once() {
		let bag = DisposableBag::new();
		let counter = Arc::new(AtomicUsize::new(0));
		for _ in 0..5 {
			bag.add(Box::new(CountingDisposable {
				counter: counter.clone(),
				fail: false,
			}));
		}
		bag.dispose().await.unwrap();
		assert_eq!(counter.load(Ordering::SeqCst), 5);

		// Disposing again is a no-op, not a second round of disposal.
		bag.dispose().await.unwrap();
		assert_eq!(counter.load(Ordering::SeqCst), 5);
	}

	#[tokio::test]
	async fn add_after_dispose_disposes_immediately() {
		let bag = DisposableBag::new();
		bag.dispose().await.unwrap();

		let counter = Arc::new(AtomicUsize::new(0));
		bag.add(Box::new(CountingDisposable {
			counter: counter.clone(),
			fail: false,
		}));

		// The disposal is spawned, not inline; give it a turn to run.
		for _ in 0..100 {
			if counter.load(Ordering::SeqCst) == 1 {
				break;
			}
			tokio::task::yield_now().await;
		}
		assert_eq!(counter.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn try_add_after_dispose_returns_item() {
		let bag = DisposableBag::new();
		bag.dispose().await.unwrap();

		let counter = Arc::new(AtomicUsize::new(0));
		let item: Box<dyn AsyncDisposable> = Box::new(CountingDisposable {
			counter: counter.clone(),
			fail: false,
		});
		let result = bag.try_add(item);
		assert!(result.is_err());
		assert_eq!(counter.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn dispose_aggregates_all_failures() {
		let bag = DisposableBag::new();
		let counter = Arc::new(AtomicUsize::new(0));
		for fail in [true, false, true] {
			bag.add(Box::new(CountingDisposable {
				counter: counter.clone(),
				fail,
			}));
		}
		let result = bag.dispose().await;
		let err = result.unwrap_err();
		assert_eq!(err.errors().len(), 2);
		assert_eq!(counter.load(Ordering::SeqCst), 3);
	}
}
