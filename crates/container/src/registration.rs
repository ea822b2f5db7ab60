use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use brokerage_core::ServiceBroker;
use tokio::sync::OnceCell;

use crate::audience::Audience;
use crate::credentials_policy::ClientCredentialsPolicy;

/// The one-shot factory a registration calls to proffer a source's broker.
///
/// Invoked at most once per source per container lifetime (§4.10: "invokes
/// the proffer callback once, memoizing its pending promise for concurrent
/// callers"); concurrent callers observe the same in-flight future. A
/// failed attempt is not cached — the next caller retries, since a
/// transient proffer failure (e.g. a not-yet-started other-process broker)
/// should not permanently blacklist the source.
pub type ProfferFactory =
	Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Arc<dyn ServiceBroker>, String>> + Send>> + Send + Sync>;

/// One proffered source: the memoized broker plus the credentials the
/// container should apply to requests served through it.
pub struct Source {
	proffer: ProfferFactory,
	cached: OnceCell<Arc<dyn ServiceBroker>>,
	pub(crate) credentials: HashMap<String, String>,
	pub(crate) credentials_policy: ClientCredentialsPolicy,
}

impl Source {
	#[must_use]
	pub fn new(proffer: ProfferFactory) -> Self {
		Self {
			proffer,
			cached: OnceCell::new(),
			credentials: HashMap::new(),
			credentials_policy: ClientCredentialsPolicy::RequestOverridesDefault,
		}
	}

	/// Attaches the view credentials and policy this source's active view
	/// associates with requests it serves (§4.10's client-credentials
	/// policy step).
	#[must_use]
	pub fn with_credentials(mut self, credentials: HashMap<String, String>, policy: ClientCredentialsPolicy) -> Self {
		self.credentials = credentials;
		self.credentials_policy = policy;
		self
	}

	pub(crate) async fn resolve(&self) -> Result<Arc<dyn ServiceBroker>, String> {
		self.cached
			.get_or_try_init(|| (self.proffer)())
			.await
			.map(Arc::clone)
	}
}

/// A process-local registration for one service moniker: who may see it
/// (§3's audience mask, plus a guest opt-in) and the sources it may be
/// proffered from.
///
/// Sources are indexed by name rather than kept in one ordered list, since
/// the search order depends on whether the consumer is local (§4.10) and
/// not on registration order.
#[derive(Default)]
pub struct Registration {
	pub audience: Audience,
	pub allow_guests: bool,
	pub(crate) same_process: Option<Arc<Source>>,
	pub(crate) other_process_same_machine: Option<Arc<Source>>,
	pub(crate) trusted_server: Option<Arc<Source>>,
	pub(crate) untrusted_server: Option<Arc<Source>>,
}

impl Registration {
	#[must_use]
	pub fn new(audience: Audience) -> Self {
		Self {
			audience,
			..Self::default()
		}
	}

	#[must_use]
	pub fn allowing_guests(mut self) -> Self {
		self.allow_guests = true;
		self
	}

	#[must_use]
	pub fn with_same_process(mut self, source: Source) -> Self {
		self.same_process = Some(Arc::new(source));
		self
	}

	#[must_use]
	pub fn with_other_process_same_machine(mut self, source: Source) -> Self {
		self.other_process_same_machine = Some(Arc::new(source));
		self
	}

	#[must_use]
	pub fn with_trusted_server(mut self, source: Source) -> Self {
		self.trusted_server = Some(Arc::new(source));
		self
	}

	#[must_use]
	pub fn with_untrusted_server(mut self, source: Source) -> Self {
		self.untrusted_server = Some(Arc::new(source));
		self
	}

	/// Sources to try, in order, for a consumer with the given locality.
	///
	/// A local consumer searches remote sources first (trusted, then
	/// untrusted), then falls through to the local sources (same-process,
	/// then other-process-same-machine); a non-local consumer only ever
	/// sees the local sources (§4.10).
	pub(crate) fn search_order(&self, consumer_is_local: bool) -> Vec<Arc<Source>> {
		let mut order = Vec::with_capacity(4);
		if consumer_is_local {
			order.extend(self.trusted_server.clone());
			order.extend(self.untrusted_server.clone());
		}
		order.extend(self.same_process.clone());
		order.extend(self.other_process_same_machine.clone());
		order
	}
}
