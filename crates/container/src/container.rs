use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use brokerage_ipc::DuplexPipe;
use brokerage_moniker::{ServiceActivationOptions, ServiceMoniker};

use crate::audience::Consumer;
use crate::error::ContainerError;
use crate::registration::Registration;

/// Process-local registry of proffered services, mapping monikers to
/// [`Registration`]s and resolving a consumer's request down to a
/// connected pipe (§4.10).
#[derive(Default)]
pub struct ServiceContainer {
	registrations: Mutex<HashMap<ServiceMoniker, Registration>>,
}

impl ServiceContainer {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Proffers `registration` under `moniker`. Replaces any prior
	/// registration for the same moniker.
	pub fn register(&self, moniker: ServiceMoniker, registration: Registration) {
		self.registrations.lock().unwrap().insert(moniker, registration);
	}

	/// Resolves `moniker` for `consumer`: looks up the registration,
	/// validates audience, then searches sources in the order §4.10
	/// specifies, returning the first source's pipe for this moniker.
	///
	/// A source whose broker returns `Ok(None)` for this moniker (present
	/// but declining to serve it) is not treated as a failure — the search
	/// falls through to the next source, the same way a sequential
	/// aggregator treats a `None` from one inner broker as "try the next
	/// one" rather than a miss.
	pub async fn get_pipe(
		&self,
		moniker: &ServiceMoniker,
		consumer: Consumer,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<Option<DuplexPipe>, ContainerError> {
		let order = {
			let registrations = self.registrations.lock().unwrap();
			let registration = registrations
				.get(moniker)
				.ok_or_else(|| ContainerError::NotLocallyRegistered(moniker.clone()))?;

			if !registration.audience.contains(consumer.audience) || (consumer.is_guest && !registration.allow_guests) {
				return Err(ContainerError::AudienceMismatch(moniker.clone()));
			}

			registration.search_order(consumer.is_local)
		};

		for source in order {
			let broker = source
				.resolve()
				.await
				.map_err(|reason| ContainerError::ProfferFailed { moniker: moniker.clone(), reason })?;

			let merged_options = source.credentials_policy.apply(&options, source.credentials.clone());
			let pipe = broker
				.get_pipe(moniker, merged_options, cancel.clone())
				.await
				.map_err(|e| ContainerError::ProfferFailed { moniker: moniker.clone(), reason: e.to_string() })?;
			if pipe.is_some() {
				return Ok(pipe);
			}
		}

		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	use async_trait::async_trait;
	use brokerage_core::{BrokerError, ServiceBroker};
	use brokerage_moniker::BrokeredServicesChangedEventArgs;
	use tokio::sync::broadcast;

	use super::*;
	use crate::audience::Audience;
	use crate::credentials_policy::ClientCredentialsPolicy;
	use crate::registration::Source;

	struct StubBroker {
		serves: &'static str,
	}

	#[async_trait]
	impl ServiceBroker for StubBroker {
		async fn get_pipe(
			&self,
			moniker: &ServiceMoniker,
			_options: ServiceActivationOptions,
			_cancel: CancellationToken,
		) -> Result<Option<DuplexPipe>, BrokerError> {
			if moniker.name() != self.serves {
				return Ok(None);
			}
			let (a, _b) = tokio::io::duplex(4);
			Ok(Some(Box::new(a)))
		}

		fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs> {
			broadcast::channel(1).1
		}
	}

	fn source_serving(name: &'static str, calls: Arc<AtomicUsize>) -> Source {
		Source::new(Arc::new(move || {
			let calls = calls.clone();
			Box::pin(async move {
				calls.fetch_add(1, Ordering::SeqCst);
				Ok(Arc::new(StubBroker { serves: name }) as Arc<dyn ServiceBroker>)
			})
		}))
	}

	#[tokio::test]
	async fn missing_registration_is_not_locally_registered() {
		let container = ServiceContainer::new();
		let result = container
			.get_pipe(
				&ServiceMoniker::new("calc"),
				Consumer { audience: Audience::SAME_PROCESS, is_guest: false, is_local: true },
				ServiceActivationOptions::default(),
				CancellationToken::new(),
			)
			.await;
		assert!(matches!(result, Err(ContainerError::NotLocallyRegistered(_))));
	}

	#[tokio::test]
	async fn audience_mismatch_is_rejected() {
		let container = ServiceContainer::new();
		let calls = Arc::new(AtomicUsize::new(0));
		container.register(
			ServiceMoniker::new("calc"),
			Registration::new(Audience::ALL_USERS).with_same_process(source_serving("calc", calls)),
		);

		let result = container
			.get_pipe(
				&ServiceMoniker::new("calc"),
				Consumer { audience: Audience::SAME_PROCESS, is_guest: false, is_local: true },
				ServiceActivationOptions::default(),
				CancellationToken::new(),
			)
			.await;
		assert!(matches!(result, Err(ContainerError::AudienceMismatch(_))));
	}

	#[tokio::test]
	async fn guest_consumer_needs_opt_in() {
		let container = ServiceContainer::new();
		let calls = Arc::new(AtomicUsize::new(0));
		container.register(
			ServiceMoniker::new("calc"),
			Registration::new(Audience::SAME_PROCESS).with_same_process(source_serving("calc", calls)),
		);

		let result = container
			.get_pipe(
				&ServiceMoniker::new("calc"),
				Consumer { audience: Audience::SAME_PROCESS, is_guest: true, is_local: true },
				ServiceActivationOptions::default(),
				CancellationToken::new(),
			)
			.await;
		assert!(matches!(result, Err(ContainerError::AudienceMismatch(_))));
	}

	#[tokio::test]
	async fn same_process_source_wins_over_other_process_when_both_present() {
		let container = ServiceContainer::new();
		let same_process_calls = Arc::new(AtomicUsize::new(0));
		let other_process_calls = Arc::new(AtomicUsize::new(0));
		container.register(
			ServiceMoniker::new("calc"),
			Registration::new(Audience::SAME_PROCESS)
				.with_same_process(source_serving("calc", same_process_calls.clone()))
				.with_other_process_same_machine(source_serving("calc", other_process_calls.clone())),
		);

		let pipe = container
			.get_pipe(
				&ServiceMoniker::new("calc"),
				Consumer { audience: Audience::SAME_PROCESS, is_guest: false, is_local: true },
				ServiceActivationOptions::default(),
				CancellationToken::new(),
			)
			.await
			.unwrap();
		assert!(pipe.is_some());
		assert_eq!(same_process_calls.load(Ordering::SeqCst), 1);
		assert_eq!(other_process_calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn falls_through_to_next_source_when_first_does_not_serve_the_moniker() {
		let container = ServiceContainer::new();
		let same_process_calls = Arc::new(AtomicUsize::new(0));
		let other_process_calls = Arc::new(AtomicUsize::new(0));
		container.register(
			ServiceMoniker::new("calc"),
			Registration::new(Audience::SAME_PROCESS)
				.with_same_process(source_serving("not-calc", same_process_calls.clone()))
				.with_other_process_same_machine(source_serving("calc", other_process_calls.clone())),
		);

		let pipe = container
			.get_pipe(
				&ServiceMoniker::new("calc"),
				Consumer { audience: Audience::SAME_PROCESS, is_guest: false, is_local: true },
				ServiceActivationOptions::default(),
				CancellationToken::new(),
			)
			.await
			.unwrap();
		assert!(pipe.is_some());
		assert_eq!(other_process_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn proffer_is_memoized_across_concurrent_callers() {
		let container = ServiceContainer::new();
		let calls = Arc::new(AtomicUsize::new(0));
		container.register(
			ServiceMoniker::new("calc"),
			Registration::new(Audience::SAME_PROCESS).with_same_process(source_serving("calc", calls.clone())),
		);
		let container = Arc::new(container);

		let mut handles = Vec::new();
		for _ in 0..8 {
			let container = container.clone();
			handles.push(tokio::spawn(async move {
				container
					.get_pipe(
						&ServiceMoniker::new("calc"),
						Consumer { audience: Audience::SAME_PROCESS, is_guest: false, is_local: true },
						ServiceActivationOptions::default(),
						CancellationToken::new(),
					)
					.await
					.unwrap()
			}));
		}
		for h in handles {
			assert!(h.await.unwrap().is_some());
		}
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn non_local_consumer_never_tries_remote_sources() {
		let container = ServiceContainer::new();
		let trusted_calls = Arc::new(AtomicUsize::new(0));
		let same_process_calls = Arc::new(AtomicUsize::new(0));
		container.register(
			ServiceMoniker::new("calc"),
			Registration::new(Audience::ALL_USERS)
				.with_trusted_server(source_serving("calc", trusted_calls.clone()))
				.with_same_process(source_serving("calc", same_process_calls.clone())),
		);

		let pipe = container
			.get_pipe(
				&ServiceMoniker::new("calc"),
				Consumer { audience: Audience::ALL_USERS, is_guest: false, is_local: false },
				ServiceActivationOptions::default(),
				CancellationToken::new(),
			)
			.await
			.unwrap();
		assert!(pipe.is_some());
		assert_eq!(trusted_calls.load(Ordering::SeqCst), 0, "non-local consumer must not touch remote sources");
		assert_eq!(same_process_calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn credentials_policy_is_available_for_the_active_view() {
		// Exercises the type used above only indirectly; a focused unit test
		// for the policy itself lives in `credentials_policy`.
		let _ = ClientCredentialsPolicy::RequestOverridesDefault;
	}
}
