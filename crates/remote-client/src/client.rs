use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use brokerage_auth::AuthorizationServiceClient;
use brokerage_core::{
	forward_availability_changed, AvailabilityChangedSource, BrokerError, MultiplexingStream, ProxyFactory,
	ProxyFactoryError, RemoteServiceBroker, ServiceBroker,
};
use brokerage_disposable::{AsyncDisposable, DisposeError};
use brokerage_ipc::{ConnectOptions, DuplexPipe};
use brokerage_moniker::{
	BrokeredServicesChangedEventArgs, RemoteServiceConnectionInfo, ServiceActivationOptions,
	ServiceBrokerClientMetadata, ServiceMoniker, SupportedConnections,
};

use crate::local_activation::LocalActivator;

/// Turns an [`RemoteServiceBroker`] — and, once a multiplexing stream is
/// attached, its sub-channels — into an [`ServiceBroker`] (§4.7).
pub struct RemoteServiceBrokerClient {
	remote: Arc<dyn RemoteServiceBroker>,
	multiplexing: Option<Arc<dyn MultiplexingStream>>,
	supported_connections: Mutex<SupportedConnections>,
	auth: Option<Arc<AuthorizationServiceClient>>,
	availability: AvailabilityChangedSource,
	forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteServiceBrokerClient {
	async fn finish_construction(
		remote: Arc<dyn RemoteServiceBroker>,
		multiplexing: Option<Arc<dyn MultiplexingStream>>,
		supported_connections: SupportedConnections,
		auth: Option<Arc<AuthorizationServiceClient>>,
		cancel: CancellationToken,
	) -> Result<Arc<Self>, BrokerError> {
		let metadata = ServiceBrokerClientMetadata::new(supported_connections);
		remote.handshake(metadata, cancel).await?;

		let availability = AvailabilityChangedSource::new();
		let forward_task = forward_availability_changed(remote.subscribe_availability_changed(), availability.clone());

		Ok(Arc::new(Self {
			remote,
			multiplexing,
			supported_connections: Mutex::new(supported_connections),
			auth,
			availability,
			forward_task: Mutex::new(Some(forward_task)),
		}))
	}

	/// Builds an RPC runtime over `pipe` for the broker contract, then
	/// handshakes advertising only the named-pipe connection kind.
	pub async fn connect_to_duplex(
		pipe: DuplexPipe,
		factory: &dyn ProxyFactory<Arc<dyn RemoteServiceBroker>>,
		auth: Option<Arc<AuthorizationServiceClient>>,
		cancel: CancellationToken,
	) -> Result<Arc<Self>, BrokerError> {
		let remote = match factory.create_proxy(pipe) {
			Ok(remote) => remote,
			Err(ProxyFactoryError { mut pipe, error }) => {
				let _ = pipe.shutdown().await;
				return Err(error);
			}
		};
		Self::finish_construction(remote, None, SupportedConnections::IPC_PIPE, auth, cancel).await
	}

	/// Accepts the default sub-channel on `stream` for the broker proxy
	/// itself, then handshakes advertising named-pipe + multiplexing
	/// support. Disposes `stream` if anything in setup fails.
	pub async fn connect_to_multiplexing_duplex(
		stream: Arc<dyn MultiplexingStream>,
		factory: &dyn ProxyFactory<Arc<dyn RemoteServiceBroker>>,
		auth: Option<Arc<AuthorizationServiceClient>>,
		cancel: CancellationToken,
	) -> Result<Arc<Self>, BrokerError> {
		let pipe = match stream.accept_channel(0).await {
			Ok(pipe) => pipe,
			Err(e) => {
				let _ = stream.dispose().await;
				return Err(e);
			}
		};
		let remote = match factory.create_proxy(pipe) {
			Ok(remote) => remote,
			Err(ProxyFactoryError { mut pipe, error }) => {
				let _ = pipe.shutdown().await;
				let _ = stream.dispose().await;
				return Err(error);
			}
		};

		let supported = SupportedConnections::IPC_PIPE | SupportedConnections::MULTIPLEXING;
		match Self::finish_construction(remote, Some(stream.clone()), supported, auth, cancel).await {
			Ok(client) => Ok(client),
			Err(e) => {
				let _ = stream.dispose().await;
				Err(e)
			}
		}
	}

	/// Re-handshakes, adding in-process activation to the advertised
	/// capability set. Idempotent: offering it twice sends the same
	/// metadata again.
	pub async fn offer_local_service_host(&self, cancel: CancellationToken) -> Result<(), BrokerError> {
		let next = {
			let supported = self.supported_connections.lock().unwrap();
			ServiceBrokerClientMetadata::new(*supported).offering_local_service_host()
		};
		self.remote.handshake(next.clone(), cancel).await?;
		*self.supported_connections.lock().unwrap() = next.supported_connections;
		Ok(())
	}

	/// Step 1 of the per-request dispatch: fills cultures from the current
	/// environment and credentials from the authorization client, when the
	/// caller did not already supply them.
	async fn fill_defaults(
		&self,
		mut options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<ServiceActivationOptions, BrokerError> {
		if options.client_culture.is_none() {
			options.client_culture = current_culture();
		}
		if options.client_ui_culture.is_none() {
			options.client_ui_culture = current_culture();
		}
		if options.client_credentials.is_empty() {
			if let Some(auth) = &self.auth {
				options.client_credentials = auth
					.client_credentials(cancel)
					.await
					.map_err(|e| BrokerError::Composition(e.to_string()))?;
			}
		}
		Ok(options)
	}

	/// Steps 2 and 4: reserves a channel, downgrading a graceful disconnect
	/// to "not found" and an empty response to `None`.
	async fn request_channel(
		&self,
		moniker: &ServiceMoniker,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<Option<RemoteServiceConnectionInfo>, BrokerError> {
		match self.remote.request_service_channel(moniker.clone(), options, cancel).await {
			Ok(info) if info.is_empty() => Ok(None),
			Ok(info) => Ok(Some(info)),
			Err(e) if e.is_graceful_disconnect() => Ok(None),
			Err(e) => Err(BrokerError::activation_failed(moniker.clone(), e)),
		}
	}

	async fn cancel_request(&self, info: &RemoteServiceConnectionInfo) {
		if let Some(id) = info.request_id {
			tracing::debug!(request_id = ?id, "releasing remote service-channel reservation after a failed dispatch");
			self.remote.cancel_service_request(id).await;
		}
	}

	/// Steps 3 and 5-6: validates the connection-info against this client's
	/// advertised `supported_connections` before dispatching it to a
	/// transport, then connects the duplex pipe. Returns `Ok(None)` when the
	/// only instruction present is in-process activation — callers that
	/// cannot represent that outcome (`get_pipe`) turn it into an error;
	/// [`get_proxy`] consults `info.local_activation` itself in that case.
	///
	/// A server that asks for a connection kind this client never
	/// advertised in its handshake (e.g. a local-activation record when
	/// [`offer_local_service_host`] was never called) is rejected here as
	/// *service-activation-failed* rather than silently honored — step 3 of
	/// §4.7.
	///
	/// [`get_proxy`]: RemoteServiceBrokerClient::get_proxy
	/// [`offer_local_service_host`]: RemoteServiceBrokerClient::offer_local_service_host
	async fn connect_pipe(
		&self,
		moniker: &ServiceMoniker,
		info: &RemoteServiceConnectionInfo,
		cancel: CancellationToken,
	) -> Result<Option<DuplexPipe>, BrokerError> {
		let supported = *self.supported_connections.lock().unwrap();

		if let Some(channel_id) = info.multiplexing_channel_id {
			if !supported.contains(SupportedConnections::MULTIPLEXING) {
				return Err(unsupported_instruction(moniker, "a multiplexing sub-channel"));
			}
			let mux = self
				.multiplexing
				.as_ref()
				.ok_or_else(|| unsupported_instruction(moniker, "a multiplexing sub-channel"))?;
			let pipe = mux
				.accept_channel(channel_id)
				.await
				.map_err(|e| BrokerError::activation_failed(moniker.clone(), e))?;
			return Ok(Some(pipe));
		}
		if let Some(pipe_name) = &info.pipe_name {
			if !supported.contains(SupportedConnections::IPC_PIPE) {
				return Err(unsupported_instruction(moniker, "a named pipe"));
			}
			let pipe = brokerage_ipc::connect(
				pipe_name,
				&cancel,
				ConnectOptions {
					allow_spin_wait: true,
					..Default::default()
				},
			)
			.await
			.map_err(|e| BrokerError::activation_failed(moniker.clone(), BrokerError::Ipc(e)))?;
			return Ok(Some(pipe));
		}
		if info.local_activation.is_some() {
			if !supported.contains(SupportedConnections::LOCAL_ACTIVATION) {
				return Err(unsupported_instruction(moniker, "in-process activation"));
			}
			return Ok(None);
		}
		Err(BrokerError::activation_failed(
			moniker.clone(),
			BrokerError::NotSupported("connection-info carried no instruction this client can satisfy".into()),
		))
	}

	/// `get-proxy<T>`: like [`ServiceBroker::get_pipe`], but also consults
	/// `local_activator` when the remote side can only offer in-process
	/// activation.
	pub async fn get_proxy<T: Send + 'static>(
		&self,
		moniker: &ServiceMoniker,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
		factory: &dyn ProxyFactory<T>,
		local_activator: Option<&dyn LocalActivator<T>>,
	) -> Result<Option<T>, BrokerError> {
		let options = self.fill_defaults(options, cancel.clone()).await?;
		let Some(info) = self.request_channel(moniker, options.clone(), cancel.clone()).await? else {
			return Ok(None);
		};

		let result = match self.connect_pipe(moniker, &info, cancel).await {
			Ok(Some(pipe)) => match factory.create_proxy(pipe) {
				Ok(proxy) => Ok(Some(proxy)),
				Err(ProxyFactoryError { mut pipe, error }) => {
					let _ = pipe.shutdown().await;
					Err(error)
				}
			},
			Ok(None) => {
				let record = info
					.local_activation
					.as_ref()
					.expect("connect_pipe only returns None when a local-activation record is present");
				match local_activator {
					Some(activator) => activator.activate(record, &options).map(Some),
					None => Err(BrokerError::activation_failed(
						moniker.clone(),
						BrokerError::NotSupported("no local activator configured for in-process activation".into()),
					)),
				}
			}
			Err(e) => Err(e),
		};

		if result.is_err() {
			self.cancel_request(&info).await;
		}
		result
	}
}

fn current_culture() -> Option<String> {
	std::env::var("LANG").ok()
}

/// Builds the *service-activation-failed* error for connection-info that
/// asks for a connection kind this client never advertised in its
/// handshake (§4.7 step 3).
fn unsupported_instruction(moniker: &ServiceMoniker, what: &str) -> BrokerError {
	BrokerError::activation_failed(
		moniker.clone(),
		BrokerError::NotSupported(format!("server requested {what}, which this client did not advertise support for")),
	)
}

#[async_trait]
impl ServiceBroker for RemoteServiceBrokerClient {
	async fn get_pipe(
		&self,
		moniker: &ServiceMoniker,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<Option<DuplexPipe>, BrokerError> {
		let options = self.fill_defaults(options, cancel.clone()).await?;
		let Some(info) = self.request_channel(moniker, options, cancel.clone()).await? else {
			return Ok(None);
		};

		let result = match self.connect_pipe(moniker, &info, cancel).await {
			Ok(Some(pipe)) => Ok(Some(pipe)),
			Ok(None) => Err(BrokerError::activation_failed(
				moniker.clone(),
				BrokerError::NotSupported("in-process activation cannot be represented as a pipe".into()),
			)),
			Err(e) => Err(e),
		};

		if result.is_err() {
			self.cancel_request(&info).await;
		}
		result
	}

	fn subscribe_availability_changed(&self) -> tokio::sync::broadcast::Receiver<BrokeredServicesChangedEventArgs> {
		self.availability.subscribe()
	}
}

#[async_trait]
impl AsyncDisposable for RemoteServiceBrokerClient {
	async fn dispose(&self) -> Result<(), DisposeError> {
		if let Some(task) = self.forward_task.lock().unwrap().take() {
			task.abort();
		}
		if let Some(mux) = &self.multiplexing {
			mux.dispose().await?;
		}
		Ok(())
	}
}

impl Drop for RemoteServiceBrokerClient {
	fn drop(&mut self) {
		if let Some(task) = self.forward_task.lock().unwrap().take() {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use tokio::sync::broadcast;

	use brokerage_ipc::{serve, ServerOptions};
	use brokerage_moniker::{LocalActivationRecord, ServiceRequestId};

	use super::*;

	struct StubRemoteBroker {
		response: Mutex<RemoteServiceConnectionInfo>,
		cancel_calls: Mutex<Vec<ServiceRequestId>>,
		availability_tx: broadcast::Sender<BrokeredServicesChangedEventArgs>,
	}

	impl StubRemoteBroker {
		fn new(response: RemoteServiceConnectionInfo) -> Arc<Self> {
			let (availability_tx, _rx) = broadcast::channel(4);
			Arc::new(Self {
				response: Mutex::new(response),
				cancel_calls: Mutex::new(Vec::new()),
				availability_tx,
			})
		}
	}

	#[async_trait]
	impl RemoteServiceBroker for StubRemoteBroker {
		async fn handshake(&self, _client_metadata: ServiceBrokerClientMetadata, _cancel: CancellationToken) -> Result<(), BrokerError> {
			Ok(())
		}

		async fn request_service_channel(
			&self,
			_moniker: ServiceMoniker,
			_options: ServiceActivationOptions,
			_cancel: CancellationToken,
		) -> Result<RemoteServiceConnectionInfo, BrokerError> {
			Ok(self.response.lock().unwrap().clone())
		}

		async fn cancel_service_request(&self, id: ServiceRequestId) {
			self.cancel_calls.lock().unwrap().push(id);
		}

		fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs> {
			self.availability_tx.subscribe()
		}
	}

	struct StubMultiplexingStream {
		accepted: Mutex<Vec<u64>>,
	}

	#[async_trait]
	impl AsyncDisposable for StubMultiplexingStream {
		async fn dispose(&self) -> Result<(), DisposeError> {
			Ok(())
		}
	}

	#[async_trait]
	impl MultiplexingStream for StubMultiplexingStream {
		async fn offer_channel(&self, _id: Option<u64>) -> Result<(u64, DuplexPipe), BrokerError> {
			unimplemented!("not exercised by these tests")
		}

		async fn accept_channel(&self, id: u64) -> Result<DuplexPipe, BrokerError> {
			self.accepted.lock().unwrap().push(id);
			let (a, b) = tokio::io::duplex(64);
			tokio::spawn(async move {
				let _b = b;
				std::future::pending::<()>().await;
			});
			Ok(Box::new(a))
		}

		async fn wait_for_acceptance(&self, _id: u64) -> Result<(), BrokerError> {
			unimplemented!("not exercised by these tests")
		}

		async fn close_channel(&self, _id: u64) -> Result<(), BrokerError> {
			unimplemented!("not exercised by these tests")
		}
	}

	fn client_over(remote: Arc<dyn RemoteServiceBroker>, multiplexing: Option<Arc<dyn MultiplexingStream>>) -> RemoteServiceBrokerClient {
		client_over_supporting(remote, multiplexing, SupportedConnections::IPC_PIPE | SupportedConnections::MULTIPLEXING)
	}

	fn client_over_supporting(
		remote: Arc<dyn RemoteServiceBroker>,
		multiplexing: Option<Arc<dyn MultiplexingStream>>,
		supported_connections: SupportedConnections,
	) -> RemoteServiceBrokerClient {
		RemoteServiceBrokerClient {
			remote,
			multiplexing,
			supported_connections: Mutex::new(supported_connections),
			auth: None,
			availability: AvailabilityChangedSource::new(),
			forward_task: Mutex::new(None),
		}
	}

	#[tokio::test]
	async fn empty_connection_info_means_not_found() {
		let remote = StubRemoteBroker::new(RemoteServiceConnectionInfo::empty());
		let client = client_over(remote, None);
		let pipe = client
			.get_pipe(&ServiceMoniker::new("calc"), ServiceActivationOptions::default(), CancellationToken::new())
			.await
			.unwrap();
		assert!(pipe.is_none());
	}

	#[tokio::test]
	async fn pipe_name_connects_over_the_ipc_transport() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("remote-client-test.sock");
		let accepted = Arc::new(AtomicUsize::new(0));
		let accepted_clone = accepted.clone();
		let (handle, address) = serve(
			path.to_str().unwrap(),
			move |_pipe| {
				let accepted = accepted_clone.clone();
				async move {
					accepted.fetch_add(1, Ordering::SeqCst);
				}
			},
			ServerOptions {
				one_client_only: true,
				..Default::default()
			},
		)
		.await
		.unwrap();

		let response = RemoteServiceConnectionInfo {
			request_id: Some(ServiceRequestId::new_random()),
			pipe_name: Some(address),
			..Default::default()
		};
		let remote = StubRemoteBroker::new(response);
		let client = client_over(remote, None);

		let pipe = client
			.get_pipe(&ServiceMoniker::new("calc"), ServiceActivationOptions::default(), CancellationToken::new())
			.await
			.unwrap();
		assert!(pipe.is_some());

		AsyncDisposable::dispose(&handle).await.unwrap();
		assert_eq!(accepted.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn multiplexing_channel_preferred_over_pipe_name_when_available() {
		let response = RemoteServiceConnectionInfo {
			request_id: Some(ServiceRequestId::new_random()),
			pipe_name: Some("unused-fallback".into()),
			multiplexing_channel_id: Some(7),
			..Default::default()
		};
		let remote = StubRemoteBroker::new(response);
		let mux = Arc::new(StubMultiplexingStream { accepted: Mutex::new(Vec::new()) });
		let client = client_over(remote, Some(mux.clone()));

		let pipe = client
			.get_pipe(&ServiceMoniker::new("calc"), ServiceActivationOptions::default(), CancellationToken::new())
			.await
			.unwrap();
		assert!(pipe.is_some());
		assert_eq!(*mux.accepted.lock().unwrap(), vec![7]);
	}

	#[tokio::test]
	async fn failure_after_reservation_cancels_the_request() {
		let id = ServiceRequestId::new_random();
		let response = RemoteServiceConnectionInfo {
			request_id: Some(id),
			pipe_name: Some("/nonexistent/path/to/a/socket.sock".into()),
			..Default::default()
		};
		let remote = StubRemoteBroker::new(response);
		let client = client_over(remote.clone(), None);

		let result = client
			.get_pipe(&ServiceMoniker::new("calc"), ServiceActivationOptions::default(), CancellationToken::new())
			.await;
		assert!(result.is_err());
		assert_eq!(*remote.cancel_calls.lock().unwrap(), vec![id]);
	}

	#[tokio::test]
	async fn get_pipe_errors_when_only_local_activation_is_offered() {
		let id = ServiceRequestId::new_random();
		let response = RemoteServiceConnectionInfo {
			request_id: Some(id),
			local_activation: Some(LocalActivationRecord {
				library_path: "libcalc.so".into(),
				entry_symbol: "activate_calc".into(),
			}),
			..Default::default()
		};
		let remote = StubRemoteBroker::new(response);
		let client = client_over(remote.clone(), None);

		let result = client
			.get_pipe(&ServiceMoniker::new("calc"), ServiceActivationOptions::default(), CancellationToken::new())
			.await;
		assert!(result.is_err());
		assert_eq!(*remote.cancel_calls.lock().unwrap(), vec![id]);
	}

	struct MarkerActivator;
	impl LocalActivator<u32> for MarkerActivator {
		fn activate(&self, _record: &LocalActivationRecord, _options: &ServiceActivationOptions) -> Result<u32, BrokerError> {
			Ok(42)
		}
	}

	struct MarkerFactory;
	impl ProxyFactory<u32> for MarkerFactory {
		fn create_proxy(&self, _pipe: DuplexPipe) -> Result<u32, ProxyFactoryError> {
			Ok(0)
		}
	}

	#[tokio::test]
	async fn get_proxy_uses_local_activator_when_only_local_activation_is_offered() {
		let response = RemoteServiceConnectionInfo {
			request_id: Some(ServiceRequestId::new_random()),
			local_activation: Some(LocalActivationRecord {
				library_path: "libcalc.so".into(),
				entry_symbol: "activate_calc".into(),
			}),
			..Default::default()
		};
		let remote = StubRemoteBroker::new(response);
		let client = client_over_supporting(
			remote,
			None,
			SupportedConnections::IPC_PIPE | SupportedConnections::MULTIPLEXING | SupportedConnections::LOCAL_ACTIVATION,
		);

		let proxy = client
			.get_proxy(
				&ServiceMoniker::new("calc"),
				ServiceActivationOptions::default(),
				CancellationToken::new(),
				&MarkerFactory,
				Some(&MarkerActivator),
			)
			.await
			.unwrap();
		assert_eq!(proxy, Some(42));
	}

	#[tokio::test]
	async fn get_proxy_rejects_local_activation_when_never_advertised() {
		// This client never called `offer_local_service_host`, so its
		// supported-connections set has no `LOCAL_ACTIVATION` bit (the
		// default `client_over` helper advertises only pipe + multiplexing).
		// A server that returns a local-activation record anyway must be
		// rejected as unsupported, not silently honored.
		let id = ServiceRequestId::new_random();
		let response = RemoteServiceConnectionInfo {
			request_id: Some(id),
			local_activation: Some(LocalActivationRecord {
				library_path: "libcalc.so".into(),
				entry_symbol: "activate_calc".into(),
			}),
			..Default::default()
		};
		let remote = StubRemoteBroker::new(response);
		let client = client_over(remote.clone(), None);

		let result = client
			.get_proxy(
				&ServiceMoniker::new("calc"),
				ServiceActivationOptions::default(),
				CancellationToken::new(),
				&MarkerFactory,
				Some(&MarkerActivator),
			)
			.await;
		assert!(matches!(
			result,
			Err(BrokerError::ServiceActivationFailed { source, .. }) if matches!(*source, BrokerError::NotSupported(_))
		));
		assert_eq!(*remote.cancel_calls.lock().unwrap(), vec![id]);
	}
}
