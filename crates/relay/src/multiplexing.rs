use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use brokerage_core::{
	forward_availability_changed, wrap_multiplexing_stream, AvailabilityChangedSource, BrokerError, MultiplexingStream,
	RemoteServiceBroker, ServiceBroker,
};
use brokerage_disposable::{AsyncDisposable, DisposeError};
use brokerage_moniker::{
	BrokeredServicesChangedEventArgs, RemoteServiceConnectionInfo, ServiceActivationOptions, ServiceBrokerClientMetadata,
	ServiceMoniker, ServiceRequestId, SupportedConnections,
};

use crate::pump::pump;

/// Exposes an inner [`ServiceBroker`] as a [`RemoteServiceBroker`] whose
/// clients reach services over sub-channels of a shared multiplexed stream
/// (§4.9).
pub struct MultiplexingRelayBroker {
	inner: Arc<dyn ServiceBroker>,
	stream: Arc<dyn MultiplexingStream>,
	pending: Arc<Mutex<HashMap<ServiceRequestId, u64>>>,
	availability: AvailabilityChangedSource,
	forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl MultiplexingRelayBroker {
	#[must_use]
	pub fn new(inner: Arc<dyn ServiceBroker>, stream: Arc<dyn MultiplexingStream>) -> Arc<Self> {
		let availability = AvailabilityChangedSource::new();
		let forward_task = forward_availability_changed(inner.subscribe_availability_changed(), availability.clone());
		Arc::new(Self {
			inner,
			stream,
			pending: Arc::new(Mutex::new(HashMap::new())),
			availability,
			forward_task: Mutex::new(Some(forward_task)),
		})
	}
}

#[async_trait]
impl RemoteServiceBroker for MultiplexingRelayBroker {
	async fn handshake(&self, client_metadata: ServiceBrokerClientMetadata, _cancel: CancellationToken) -> Result<(), BrokerError> {
		if !client_metadata.supported_connections.contains(SupportedConnections::MULTIPLEXING) {
			return Err(BrokerError::NotSupported(
				"client does not support the multiplexing connection kind".into(),
			));
		}
		Ok(())
	}

	async fn request_service_channel(
		&self,
		moniker: ServiceMoniker,
		mut options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<RemoteServiceConnectionInfo, BrokerError> {
		options.multiplexing_stream = Some(wrap_multiplexing_stream(self.stream.clone()));

		let Some(service_pipe) = self.inner.get_pipe(&moniker, options, cancel).await? else {
			return Ok(RemoteServiceConnectionInfo::empty());
		};

		let (channel_id, sub_pipe) = match self.stream.offer_channel(None).await {
			Ok(offered) => offered,
			Err(e) => {
				let mut service_pipe = service_pipe;
				let _ = service_pipe.shutdown().await;
				return Err(BrokerError::activation_failed(moniker, e));
			}
		};

		let request_id = ServiceRequestId::new_random();
		self.pending.lock().unwrap().insert(request_id, channel_id);

		tokio::spawn(pump(sub_pipe, service_pipe));

		let pending = self.pending.clone();
		let stream = self.stream.clone();
		tokio::spawn(async move {
			if stream.wait_for_acceptance(channel_id).await.is_ok() {
				pending.lock().unwrap().remove(&request_id);
			}
		});

		Ok(RemoteServiceConnectionInfo {
			request_id: Some(request_id),
			multiplexing_channel_id: Some(channel_id),
			..Default::default()
		})
	}

	async fn cancel_service_request(&self, id: ServiceRequestId) {
		let channel_id = self.pending.lock().unwrap().remove(&id);
		if let Some(channel_id) = channel_id {
			if let Err(e) = self.stream.close_channel(channel_id).await {
				tracing::warn!(error = %e, "closing a cancelled multiplexing sub-channel failed");
			}
		}
	}

	fn subscribe_availability_changed(&self) -> tokio::sync::broadcast::Receiver<BrokeredServicesChangedEventArgs> {
		self.availability.subscribe()
	}
}

#[async_trait]
impl AsyncDisposable for MultiplexingRelayBroker {
	async fn dispose(&self) -> Result<(), DisposeError> {
		if let Some(task) = self.forward_task.lock().unwrap().take() {
			task.abort();
		}
		let channels: Vec<_> = self.pending.lock().unwrap().drain().map(|(_, channel_id)| channel_id).collect();
		for channel_id in channels {
			self.stream.close_channel(channel_id).await.map_err(|e| DisposeError::new(e.to_string()))?;
		}
		Ok(())
	}
}

impl Drop for MultiplexingRelayBroker {
	fn drop(&mut self) {
		if let Some(task) = self.forward_task.lock().unwrap().take() {
			task.abort();
		}
	}
}
