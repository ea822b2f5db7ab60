use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use brokerage_moniker::BrokeredServicesChangedEventArgs;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An async invalidation handler: `(impacted, cancel) -> task`.
pub type InvalidatedHandler = Arc<dyn Fn(BrokeredServicesChangedEventArgs, CancellationToken) -> BoxFuture + Send + Sync>;

struct Drain {
	cancel: CancellationToken,
	task: tokio::task::JoinHandle<()>,
}

/// Drains a registered handler list on a background worker, one batch per
/// invalidation.
///
/// A new invalidation never runs concurrently with its own previous batch:
/// it cancels the previous batch's token and waits for that batch's task to
/// observe completion before starting the next one. Handlers within one
/// batch run concurrently with each other.
pub(crate) struct InvalidatedDrainer {
	handlers: std::sync::Mutex<Vec<InvalidatedHandler>>,
	previous: AsyncMutex<Option<Drain>>,
}

impl InvalidatedDrainer {
	pub(crate) fn new() -> Self {
		Self {
			handlers: std::sync::Mutex::new(Vec::new()),
			previous: AsyncMutex::new(None),
		}
	}

	pub(crate) fn subscribe(&self, handler: InvalidatedHandler) {
		self.handlers.lock().unwrap().push(handler);
	}

	/// Raises `args` to the current handler set. Never inlines handler
	/// work on the caller's task: this only waits for the *previous*
	/// batch to wind down (via its pre-cancelled token) before spawning the
	/// next one.
	pub(crate) async fn raise(&self, args: BrokeredServicesChangedEventArgs) {
		let handlers: Vec<_> = self.handlers.lock().unwrap().clone();

		let mut slot = self.previous.lock().await;
		if let Some(prev) = slot.take() {
			prev.cancel.cancel();
			let _ = prev.task.await;
		}

		let cancel = CancellationToken::new();
		let batch_cancel = cancel.clone();
		let task = tokio::spawn(async move {
			let mut set = JoinSet::new();
			for handler in handlers {
				let args = args.clone();
				let cancel = batch_cancel.clone();
				set.spawn(async move { handler(args, cancel).await });
			}
			while set.join_next().await.is_some() {}
		});
		*slot = Some(Drain { cancel, task });
	}

	/// Cancels and joins the in-flight batch, if any, without starting a
	/// new one — used when the owning cache is disposed.
	pub(crate) async fn shutdown(&self) {
		let prev = self.previous.lock().await.take();
		if let Some(prev) = prev {
			prev.cancel.cancel();
			let _ = prev.task.await;
		}
	}
}
