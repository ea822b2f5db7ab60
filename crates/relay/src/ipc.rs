use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use brokerage_core::{
	forward_availability_changed, AvailabilityChangedSource, BrokerError, RemoteServiceBroker, ServiceBroker,
};
use brokerage_disposable::{AsyncDisposable, DisposableBag, DisposeError};
use brokerage_ipc::{serve, DuplexPipe, ServerOptions};
use brokerage_moniker::{
	BrokeredServicesChangedEventArgs, RemoteServiceConnectionInfo, ServiceActivationOptions, ServiceBrokerClientMetadata,
	ServiceMoniker, ServiceRequestId, SupportedConnections,
};

use crate::pump::pump;

/// Exposes an inner [`ServiceBroker`] as a [`RemoteServiceBroker`] whose
/// clients connect over named pipes / Unix sockets (§4.8).
///
/// Every `request-service-channel` call stands up a fresh, single-shot IPC
/// server; once a client connects, its on-connect handler pumps bytes
/// bidirectionally between the incoming stream and the inner broker's local
/// pipe until either side closes.
pub struct IpcRelayBroker {
	inner: Arc<dyn ServiceBroker>,
	pending: Arc<Mutex<HashMap<ServiceRequestId, Arc<DisposableBag>>>>,
	availability: AvailabilityChangedSource,
	forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl IpcRelayBroker {
	#[must_use]
	pub fn new(inner: Arc<dyn ServiceBroker>) -> Arc<Self> {
		let availability = AvailabilityChangedSource::new();
		let forward_task = forward_availability_changed(inner.subscribe_availability_changed(), availability.clone());
		Arc::new(Self {
			inner,
			pending: Arc::new(Mutex::new(HashMap::new())),
			availability,
			forward_task: Mutex::new(Some(forward_task)),
		})
	}
}

/// Holds a service pipe that either the on-connect handler or a cancellation
/// may claim, whichever happens first.
struct PipeSlot(Arc<tokio::sync::Mutex<Option<DuplexPipe>>>);

#[async_trait]
impl AsyncDisposable for PipeSlot {
	async fn dispose(&self) -> Result<(), DisposeError> {
		if let Some(mut pipe) = self.0.lock().await.take() {
			let _ = pipe.shutdown().await;
		}
		Ok(())
	}
}

#[async_trait]
impl RemoteServiceBroker for IpcRelayBroker {
	async fn handshake(&self, client_metadata: ServiceBrokerClientMetadata, _cancel: CancellationToken) -> Result<(), BrokerError> {
		if !client_metadata.supported_connections.contains(SupportedConnections::IPC_PIPE) {
			return Err(BrokerError::NotSupported(
				"client does not support the named-pipe connection kind".into(),
			));
		}
		Ok(())
	}

	async fn request_service_channel(
		&self,
		moniker: ServiceMoniker,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<RemoteServiceConnectionInfo, BrokerError> {
		let Some(service_pipe) = self.inner.get_pipe(&moniker, options, cancel).await? else {
			return Ok(RemoteServiceConnectionInfo::empty());
		};

		let request_id = ServiceRequestId::new_random();
		let channel_name = brokerage_ipc::fresh_channel_name("relay");
		let service_pipe = Arc::new(tokio::sync::Mutex::new(Some(service_pipe)));

		let pending_for_connect = self.pending.clone();
		let service_pipe_for_connect = service_pipe.clone();
		let server_result = serve(
			&channel_name,
			move |client_pipe| {
				let pending = pending_for_connect.clone();
				let service_pipe = service_pipe_for_connect.clone();
				async move {
					pending.lock().unwrap().remove(&request_id);
					let Some(service_pipe) = service_pipe.lock().await.take() else {
						return;
					};
					pump(client_pipe, service_pipe).await;
				}
			},
			ServerOptions {
				one_client_only: true,
				..Default::default()
			},
		)
		.await;

		let (handle, address) = match server_result {
			Ok(pair) => pair,
			Err(e) => {
				if let Some(mut pipe) = service_pipe.lock().await.take() {
					let _ = pipe.shutdown().await;
				}
				return Err(BrokerError::activation_failed(moniker, BrokerError::Ipc(e.into())));
			}
		};

		let bag = Arc::new(DisposableBag::new());
		bag.add(Box::new(PipeSlot(service_pipe)));
		bag.add(Box::new(handle));
		self.pending.lock().unwrap().insert(request_id, bag);

		Ok(RemoteServiceConnectionInfo {
			request_id: Some(request_id),
			pipe_name: Some(address),
			..Default::default()
		})
	}

	async fn cancel_service_request(&self, id: ServiceRequestId) {
		let bag = self.pending.lock().unwrap().remove(&id);
		if let Some(bag) = bag {
			if let Err(e) = bag.dispose().await {
				tracing::warn!(error = %e, "disposing a cancelled relay reservation failed");
			}
		}
	}

	fn subscribe_availability_changed(&self) -> tokio::sync::broadcast::Receiver<BrokeredServicesChangedEventArgs> {
		self.availability.subscribe()
	}
}

#[async_trait]
impl AsyncDisposable for IpcRelayBroker {
	async fn dispose(&self) -> Result<(), DisposeError> {
		if let Some(task) = self.forward_task.lock().unwrap().take() {
			task.abort();
		}
		let pending: Vec<_> = self.pending.lock().unwrap().drain().map(|(_, bag)| bag).collect();
		for bag in pending {
			bag.dispose().await.map_err(|e| DisposeError::new(e.to_string()))?;
		}
		Ok(())
	}
}

impl Drop for IpcRelayBroker {
	fn drop(&mut self) {
		if let Some(task) = self.forward_task.lock().unwrap().take() {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::io;

	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use brokerage_moniker::ServiceActivationOptions;

	use super::*;

	struct EchoBroker;

	#[async_trait]
	impl ServiceBroker for EchoBroker {
		async fn get_pipe(
			&self,
			moniker: &ServiceMoniker,
			_options: ServiceActivationOptions,
			_cancel: CancellationToken,
		) -> Result<Option<DuplexPipe>, BrokerError> {
			if moniker.name() != "echo" {
				return Ok(None);
			}
			let (ours, theirs) = tokio::io::duplex(256);
			tokio::spawn(async move {
				let mut ours = ours;
				let mut buf = [0u8; 256];
				loop {
					match ours.read(&mut buf).await {
						Ok(0) | Err(_) => break,
						Ok(n) => {
							if ours.write_all(&buf[..n]).await.is_err() {
								break;
							}
						}
					}
				}
			});
			Ok(Some(Box::new(theirs)))
		}

		fn subscribe_availability_changed(&self) -> tokio::sync::broadcast::Receiver<BrokeredServicesChangedEventArgs> {
			let (_tx, rx) = tokio::sync::broadcast::channel(1);
			rx
		}
	}

	#[tokio::test]
	async fn unknown_service_yields_empty_connection_info() {
		let relay = IpcRelayBroker::new(Arc::new(EchoBroker));
		let info = relay
			.request_service_channel(ServiceMoniker::new("missing"), ServiceActivationOptions::default(), CancellationToken::new())
			.await
			.unwrap();
		assert!(info.is_empty());
	}

	#[tokio::test]
	async fn client_connect_pumps_bytes_to_the_inner_pipe() -> io::Result<()> {
		let relay = IpcRelayBroker::new(Arc::new(EchoBroker));
		let info = relay
			.request_service_channel(ServiceMoniker::new("echo"), ServiceActivationOptions::default(), CancellationToken::new())
			.await
			.unwrap();
		assert!(info.request_id.is_some());
		let address = info.pipe_name.unwrap();

		let mut client = brokerage_ipc::connect(
			&address,
			&CancellationToken::new(),
			brokerage_ipc::ConnectOptions {
				allow_spin_wait: true,
				..Default::default()
			},
		)
		.await
		.unwrap();
		client.write_all(b"ping").await?;
		let mut buf = [0u8; 4];
		client.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"ping");
		Ok(())
	}

	#[tokio::test]
	async fn cancel_disposes_the_pending_reservation() {
		let relay = IpcRelayBroker::new(Arc::new(EchoBroker));
		let info = relay
			.request_service_channel(ServiceMoniker::new("echo"), ServiceActivationOptions::default(), CancellationToken::new())
			.await
			.unwrap();
		let id = info.request_id.unwrap();
		assert_eq!(relay.pending.lock().unwrap().len(), 1);

		relay.cancel_service_request(id).await;
		assert_eq!(relay.pending.lock().unwrap().len(), 0);

		let result = brokerage_ipc::connect(
			&info.pipe_name.unwrap(),
			&CancellationToken::new(),
			brokerage_ipc::ConnectOptions {
				allow_spin_wait: true,
				max_retries: 2,
				..Default::default()
			},
		)
		.await;
		assert!(result.is_err(), "a cancelled reservation's server must no longer accept");
	}
}
