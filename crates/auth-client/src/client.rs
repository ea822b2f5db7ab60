use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use brokerage_moniker::ProtectedOperation;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::error::AuthError;
use crate::service::AuthorizationService;

/// Every distinct [`ProtectedOperation`] seen under one moniker, with the
/// verdict the remote service returned for it.
type CachedVerdicts = HashMap<String, Vec<(ProtectedOperation, bool)>>;

/// A local, coherent cache in front of a remote [`AuthorizationService`]
/// (§4.6).
///
/// Superset/subset reasoning over cached verdicts answers most repeat
/// queries without a round trip: an approved entry `A` answers `true` for
/// any `B'` with `A ⊇ B'`; a denied entry `D` answers `false` for any `B''`
/// with `B'' ⊇ D`.
pub struct AuthorizationServiceClient {
	service: Arc<dyn AuthorizationService>,
	cached: Mutex<CachedVerdicts>,
	credentials: Mutex<Arc<OnceCell<HashMap<String, String>>>>,
	forward_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl AuthorizationServiceClient {
	/// Builds a client over `service`, subscribing to its
	/// authorization-changed and credentials-changed events for the
	/// lifetime of the returned `Arc`.
	#[must_use]
	pub fn new(service: Arc<dyn AuthorizationService>) -> Arc<Self> {
		let client = Arc::new(Self {
			service: service.clone(),
			cached: Mutex::new(HashMap::new()),
			credentials: Mutex::new(Arc::new(OnceCell::new())),
			forward_tasks: Mutex::new(Vec::new()),
		});

		let mut auth_changed = service.subscribe_authorization_changed();
		let auth_weak = Arc::downgrade(&client);
		let auth_task = tokio::spawn(async move {
			while auth_changed.recv().await.is_ok() {
				let Some(client) = auth_weak.upgrade() else { break };
				client.cached.lock().unwrap().clear();
				tracing::debug!("authorization cache cleared by authorization-changed event");
			}
		});

		let mut creds_changed = service.subscribe_credentials_changed();
		let creds_weak = Arc::downgrade(&client);
		let creds_task = tokio::spawn(async move {
			while creds_changed.recv().await.is_ok() {
				let Some(client) = creds_weak.upgrade() else { break };
				*client.credentials.lock().unwrap() = Arc::new(OnceCell::new());
			}
		});

		*client.forward_tasks.lock().unwrap() = vec![auth_task, creds_task];
		client
	}

	/// Checks whether `op` is currently authorized, answering from the
	/// cache via superset/subset reasoning where possible and otherwise
	/// calling through to the remote service.
	pub async fn check_authorization(&self, op: &ProtectedOperation, cancel: CancellationToken) -> Result<bool, AuthError> {
		if let Some(verdict) = self.cached_verdict(op) {
			return Ok(verdict);
		}

		let approved = self.service.check_authorization(op, cancel).await?;
		self.cached
			.lock()
			.unwrap()
			.entry(op.moniker.clone())
			.or_default()
			.push((op.clone(), approved));
		Ok(approved)
	}

	fn cached_verdict(&self, op: &ProtectedOperation) -> Option<bool> {
		let cached = self.cached.lock().unwrap();
		let entries = cached.get(&op.moniker)?;
		if entries.iter().any(|(candidate, approved)| *approved && candidate.is_superset_of(op)) {
			return Some(true);
		}
		if entries.iter().any(|(candidate, approved)| !*approved && op.is_superset_of(candidate)) {
			return Some(false);
		}
		None
	}

	/// The last-known credential set, fetched once and reused until a
	/// credentials-changed event replaces the lazy cell backing it.
	pub async fn client_credentials(&self, cancel: CancellationToken) -> Result<HashMap<String, String>, AuthError> {
		let cell = self.credentials.lock().unwrap().clone();
		cell.get_or_try_init(|| self.service.get_credentials(cancel)).await.cloned()
	}
}

impl Drop for AuthorizationServiceClient {
	fn drop(&mut self) {
		for task in self.forward_tasks.lock().unwrap().drain(..) {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;
	use tokio::sync::broadcast;

	use super::*;

	struct StubService {
		calls: std::sync::atomic::AtomicUsize,
		auth_changed: broadcast::Sender<()>,
		creds_changed: broadcast::Sender<()>,
	}

	impl StubService {
		fn new() -> Arc<Self> {
			let (auth_changed, _) = broadcast::channel(4);
			let (creds_changed, _) = broadcast::channel(4);
			Arc::new(Self {
				calls: std::sync::atomic::AtomicUsize::new(0),
				auth_changed,
				creds_changed,
			})
		}
	}

	#[async_trait]
	impl AuthorizationService for StubService {
		async fn check_authorization(&self, op: &ProtectedOperation, _cancel: CancellationToken) -> Result<bool, AuthError> {
			self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			Ok(op.trust_level.unwrap_or(0) >= 3)
		}

		async fn get_credentials(&self, _cancel: CancellationToken) -> Result<HashMap<String, String>, AuthError> {
			Ok(HashMap::from([("token".to_string(), "abc".to_string())]))
		}

		fn subscribe_authorization_changed(&self) -> broadcast::Receiver<()> {
			self.auth_changed.subscribe()
		}

		fn subscribe_credentials_changed(&self) -> broadcast::Receiver<()> {
			self.creds_changed.subscribe()
		}
	}

	#[tokio::test]
	async fn superset_of_approved_answers_without_upstream_call() {
		let service = StubService::new();
		let client = AuthorizationServiceClient::new(service.clone());

		let approved = client
			.check_authorization(&ProtectedOperation::new("foo", Some(3)), CancellationToken::new())
			.await
			.unwrap();
		assert!(approved);
		assert_eq!(service.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

		let also_approved = client
			.check_authorization(&ProtectedOperation::new("foo", Some(1)), CancellationToken::new())
			.await
			.unwrap();
		assert!(also_approved);
		assert_eq!(
			service.calls.load(std::sync::atomic::Ordering::SeqCst),
			1,
			"superset reasoning must avoid a second upstream call"
		);
	}

	#[tokio::test]
	async fn subset_of_denied_answers_without_upstream_call() {
		let service = StubService::new();
		let client = AuthorizationServiceClient::new(service.clone());

		let denied = client
			.check_authorization(&ProtectedOperation::new("foo", Some(1)), CancellationToken::new())
			.await
			.unwrap();
		assert!(!denied);

		let also_denied = client
			.check_authorization(&ProtectedOperation::new("foo", Some(2)), CancellationToken::new())
			.await
			.unwrap();
		assert!(!also_denied);
		assert_eq!(service.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn authorization_changed_clears_the_cache() {
		let service = StubService::new();
		let client = AuthorizationServiceClient::new(service.clone());

		client
			.check_authorization(&ProtectedOperation::new("foo", Some(3)), CancellationToken::new())
			.await
			.unwrap();
		service.auth_changed.send(()).unwrap();
		for _ in 0..100 {
			tokio::task::yield_now().await;
		}

		client
			.check_authorization(&ProtectedOperation::new("foo", Some(3)), CancellationToken::new())
			.await
			.unwrap();
		assert_eq!(service.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn credentials_changed_replaces_the_lazy_cell() {
		let service = StubService::new();
		let client = AuthorizationServiceClient::new(service.clone());

		let first = client.client_credentials(CancellationToken::new()).await.unwrap();
		let second = client.client_credentials(CancellationToken::new()).await.unwrap();
		assert_eq!(first, second);

		service.creds_changed.send(()).unwrap();
		for _ in 0..100 {
			tokio::task::yield_now().await;
		}
		let third = client.client_credentials(CancellationToken::new()).await.unwrap();
		assert_eq!(third, first, "stub always returns the same map, but the cell itself must have been rebuilt");
	}
}
