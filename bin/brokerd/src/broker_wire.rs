//! Wire-level implementation of the `IRemoteServiceBroker` contract (§6):
//! handshake, per-request channel negotiation, reservation cancellation,
//! and an unsolicited availability-changed notification, framed as
//! newline-delimited JSON over a [`MainLoop`].
//!
//! This lives in the binary rather than a library crate on purpose: the
//! generic `brokerage-rpc` pump is deliberately protocol-agnostic, and
//! nothing else in the workspace needs this exact framing — a consumer
//! with a different wire format plugs its own [`Protocol`] into the same
//! pump instead.

use std::io::ErrorKind;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tower_service::Service;

use brokerage_core::{AvailabilityChangedSource, BrokerError, RemoteServiceBroker};
use brokerage_moniker::{
	BrokeredServicesChangedEventArgs, RemoteServiceConnectionInfo, ServiceActivationOptions, ServiceBrokerClientMetadata,
	ServiceMoniker, ServiceRequestId,
};
use brokerage_rpc::{AnyEvent, CounterIdGen, Inbound, MainLoop, PeerSocket, Protocol, RpcService};
use tokio_util::sync::CancellationToken;

/// One call a broker-wire client may issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "call", content = "args")]
pub enum BrokerCall {
	Handshake(ServiceBrokerClientMetadata),
	RequestServiceChannel {
		moniker: ServiceMoniker,
		options: ServiceActivationOptions,
	},
	CancelServiceRequest(ServiceRequestId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerRequest {
	pub id: u64,
	pub call: BrokerCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", content = "value")]
pub enum BrokerCallResult {
	Handshake,
	ServiceChannel(RemoteServiceConnectionInfo),
	Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerResponse {
	pub id: u64,
	pub result: Option<BrokerCallResult>,
	pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerNotification {
	pub availability_changed: BrokeredServicesChangedEventArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame")]
pub enum BrokerFrame {
	Request(BrokerRequest),
	Response(BrokerResponse),
	Notification(BrokerNotification),
}

/// Newline-delimited JSON framing for [`BrokerFrame`], mirroring the demo
/// calculator protocol's shape.
#[derive(Debug, Clone, Default)]
pub struct BrokerWireProtocol;

impl Protocol for BrokerWireProtocol {
	type Id = u64;
	type Message = BrokerFrame;
	type Request = BrokerRequest;
	type Response = BrokerResponse;
	type Notification = BrokerNotification;
	type ReqResult = BrokerCallResult;
	type ReqError = String;
	type LoopError = std::io::Error;
	type IdGen = CounterIdGen;

	fn next_id(id_gen: &mut Self::IdGen) -> Self::Id {
		id_gen.next()
	}

	async fn read_message(&mut self, input: &mut (impl AsyncBufRead + Unpin + Send)) -> std::io::Result<Self::Message> {
		let mut line = String::new();
		let bytes = input.read_line(&mut line).await?;
		if bytes == 0 {
			return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "peer closed the stream"));
		}
		serde_json::from_str(line.trim_end()).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
	}

	async fn write_message(&mut self, output: &mut (impl AsyncWrite + Unpin + Send), msg: &Self::Message) -> std::io::Result<()> {
		let mut line = serde_json::to_string(msg).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
		line.push('\n');
		output.write_all(line.as_bytes()).await?;
		output.flush().await
	}

	fn split_inbound(msg: Self::Message) -> Inbound<Self::Request, Self::Response, Self::Notification> {
		match msg {
			BrokerFrame::Request(req) => Inbound::Request(req),
			BrokerFrame::Response(resp) => Inbound::Response(resp),
			BrokerFrame::Notification(notif) => Inbound::Notification(notif),
		}
	}

	fn request_id(req: &Self::Request) -> Self::Id {
		req.id
	}

	fn set_request_id(req: &mut Self::Request, id: Self::Id) {
		req.id = id;
	}

	fn response_id(resp: &Self::Response) -> Self::Id {
		resp.id
	}

	fn wrap_request(req: Self::Request) -> Self::Message {
		BrokerFrame::Request(req)
	}

	fn wrap_response(resp: Self::Response) -> Self::Message {
		BrokerFrame::Response(resp)
	}

	fn wrap_notification(notif: Self::Notification) -> Self::Message {
		BrokerFrame::Notification(notif)
	}

	fn response_ok(id: Self::Id, result: Self::ReqResult) -> Self::Response {
		Self::Response {
			id,
			result: Some(result),
			error: None,
		}
	}

	fn response_err(id: Self::Id, error: Self::ReqError) -> Self::Response {
		Self::Response {
			id,
			result: None,
			error: Some(error),
		}
	}

	fn is_disconnect(err: &Self::LoopError) -> bool {
		matches!(
			err.kind(),
			ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
		)
	}
}

type BrokerPeerSocket = PeerSocket<BrokerFrame, BrokerRequest, BrokerResponse>;

/// Server-side `tower_service::Service` answering broker-wire requests by
/// delegating to an inner [`RemoteServiceBroker`]; forwards its
/// availability-changed events out as unsolicited notifications for as
/// long as the connection lives.
pub struct BrokerWireServer {
	broker: std::sync::Arc<dyn RemoteServiceBroker>,
	availability_task: Option<tokio::task::JoinHandle<()>>,
}

impl BrokerWireServer {
	#[must_use]
	pub fn new(broker: std::sync::Arc<dyn RemoteServiceBroker>, peer: BrokerPeerSocket) -> Self {
		let mut events = broker.subscribe_availability_changed();
		let availability_task = tokio::spawn(async move {
			loop {
				match events.recv().await {
					Ok(args) => {
						let notif = BrokerFrame::Notification(BrokerNotification { availability_changed: args });
						if peer.notify(notif).is_err() {
							break;
						}
					}
					Err(broadcast::error::RecvError::Lagged(_)) => continue,
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});
		Self {
			broker,
			availability_task: Some(availability_task),
		}
	}
}

impl Drop for BrokerWireServer {
	fn drop(&mut self) {
		if let Some(task) = self.availability_task.take() {
			task.abort();
		}
	}
}

impl Service<BrokerRequest> for BrokerWireServer {
	type Response = BrokerCallResult;
	type Error = String;
	type Future = Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, req: BrokerRequest) -> Self::Future {
		let broker = self.broker.clone();
		Box::pin(async move {
			match req.call {
				BrokerCall::Handshake(metadata) => {
					broker
						.handshake(metadata, CancellationToken::new())
						.await
						.map_err(|e| e.to_string())?;
					Ok(BrokerCallResult::Handshake)
				}
				BrokerCall::RequestServiceChannel { moniker, options } => {
					let info = broker
						.request_service_channel(moniker, options, CancellationToken::new())
						.await
						.map_err(|e| e.to_string())?;
					Ok(BrokerCallResult::ServiceChannel(info))
				}
				BrokerCall::CancelServiceRequest(id) => {
					broker.cancel_service_request(id).await;
					Ok(BrokerCallResult::Cancel)
				}
			}
		})
	}
}

impl RpcService<BrokerWireProtocol> for BrokerWireServer {
	type LoopError = std::io::Error;

	fn emit(&mut self, _event: AnyEvent) -> ControlFlow<Result<(), Self::LoopError>> {
		ControlFlow::Continue(())
	}
}

/// Client-side half of the same connection: answers no inbound requests
/// (a pure client never serves any) and republishes inbound
/// availability-changed notifications onto an [`AvailabilityChangedSource`].
struct BrokerWireClientSink {
	availability: AvailabilityChangedSource,
}

impl Service<BrokerRequest> for BrokerWireClientSink {
	type Response = BrokerCallResult;
	type Error = String;
	type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, _req: BrokerRequest) -> Self::Future {
		std::future::ready(Err("this connection does not serve inbound broker-wire requests".to_string()))
	}
}

impl RpcService<BrokerWireProtocol> for BrokerWireClientSink {
	type LoopError = std::io::Error;

	fn notify(&mut self, notif: BrokerNotification) -> ControlFlow<Result<(), Self::LoopError>> {
		self.availability.raise(notif.availability_changed);
		ControlFlow::Continue(())
	}
}

/// A [`RemoteServiceBroker`] proxy that speaks [`BrokerWireProtocol`] over
/// a connected duplex stream, driven by its own [`MainLoop`] task.
pub struct BrokerWireClient {
	peer: BrokerPeerSocket,
	availability: AvailabilityChangedSource,
	loop_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<(), std::io::Error>>>>,
}

impl BrokerWireClient {
	pub fn connect<R, W>(reader: R, writer: W) -> Self
	where
		R: AsyncBufRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let availability = AvailabilityChangedSource::new();
		let sink_availability = availability.clone();
		let (main_loop, peer) = MainLoop::new(
			move |_peer| BrokerWireClientSink {
				availability: sink_availability,
			},
			BrokerWireProtocol,
			CounterIdGen::new(),
		);
		let loop_task = tokio::spawn(main_loop.run(reader, writer));
		Self {
			peer,
			availability,
			loop_task: tokio::sync::Mutex::new(Some(loop_task)),
		}
	}

	async fn call(&self, call: BrokerCall) -> Result<BrokerCallResult, BrokerError> {
		let resp = self
			.peer
			.request(BrokerRequest { id: 0, call })
			.await
			.map_err(|_| BrokerError::NotSupported("broker-wire connection closed".into()))?;
		match (resp.result, resp.error) {
			(Some(result), None) => Ok(result),
			(_, Some(error)) => Err(BrokerError::NotSupported(error)),
			(None, None) => Err(BrokerError::NotSupported("broker-wire reply carried neither a result nor an error".into())),
		}
	}
}

#[async_trait]
impl RemoteServiceBroker for BrokerWireClient {
	async fn handshake(&self, client_metadata: ServiceBrokerClientMetadata, _cancel: CancellationToken) -> Result<(), BrokerError> {
		match self.call(BrokerCall::Handshake(client_metadata)).await? {
			BrokerCallResult::Handshake => Ok(()),
			other => unexpected_result("handshake", other),
		}
	}

	async fn request_service_channel(
		&self,
		moniker: ServiceMoniker,
		options: ServiceActivationOptions,
		_cancel: CancellationToken,
	) -> Result<RemoteServiceConnectionInfo, BrokerError> {
		match self.call(BrokerCall::RequestServiceChannel { moniker, options }).await? {
			BrokerCallResult::ServiceChannel(info) => Ok(info),
			other => unexpected_result("request-service-channel", other),
		}
	}

	async fn cancel_service_request(&self, id: ServiceRequestId) {
		let _ = self.call(BrokerCall::CancelServiceRequest(id)).await;
	}

	fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs> {
		self.availability.subscribe()
	}
}

impl Drop for BrokerWireClient {
	fn drop(&mut self) {
		if let Ok(mut task) = self.loop_task.try_lock() {
			if let Some(task) = task.take() {
				task.abort();
			}
		}
	}
}

fn unexpected_result<T>(call: &str, result: BrokerCallResult) -> Result<T, BrokerError> {
	Err(BrokerError::NotSupported(format!(
		"broker-wire peer answered {call} with an unexpected result shape: {result:?}"
	)))
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use tokio::sync::Mutex as AsyncMutex;

	use brokerage_moniker::SupportedConnections;

	use super::*;

	struct StubBroker {
		response: AsyncMutex<RemoteServiceConnectionInfo>,
		availability_tx: broadcast::Sender<BrokeredServicesChangedEventArgs>,
	}

	impl StubBroker {
		fn new(response: RemoteServiceConnectionInfo) -> Arc<Self> {
			let (availability_tx, _rx) = broadcast::channel(4);
			Arc::new(Self {
				response: AsyncMutex::new(response),
				availability_tx,
			})
		}
	}

	#[async_trait]
	impl RemoteServiceBroker for StubBroker {
		async fn handshake(&self, client_metadata: ServiceBrokerClientMetadata, _cancel: CancellationToken) -> Result<(), BrokerError> {
			if !client_metadata.supported_connections.contains(SupportedConnections::IPC_PIPE) {
				return Err(BrokerError::NotSupported("client must support named pipes".into()));
			}
			Ok(())
		}

		async fn request_service_channel(
			&self,
			_moniker: ServiceMoniker,
			_options: ServiceActivationOptions,
			_cancel: CancellationToken,
		) -> Result<RemoteServiceConnectionInfo, BrokerError> {
			Ok(self.response.lock().await.clone())
		}

		async fn cancel_service_request(&self, _id: ServiceRequestId) {}

		fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs> {
			self.availability_tx.subscribe()
		}
	}

	fn spawn_server(broker: Arc<dyn RemoteServiceBroker>) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<()>) {
		let (client_side, server_side) = tokio::io::duplex(8192);
		let (server_read, server_write) = tokio::io::split(server_side);
		let task = tokio::spawn(async move {
			let (main_loop, peer) = MainLoop::new(
				move |peer| BrokerWireServer::new(broker, peer),
				BrokerWireProtocol,
				CounterIdGen::new(),
			);
			drop(peer);
			let _ = main_loop.run(tokio::io::BufReader::new(server_read), server_write).await;
		});
		(client_side, task)
	}

	#[tokio::test]
	async fn handshake_round_trips() {
		let (client_side, _server_task) = spawn_server(StubBroker::new(RemoteServiceConnectionInfo::empty()));
		let (reader, writer) = tokio::io::split(client_side);
		let client = BrokerWireClient::connect(tokio::io::BufReader::new(reader), writer);

		let metadata = ServiceBrokerClientMetadata::new(SupportedConnections::IPC_PIPE);
		client.handshake(metadata, CancellationToken::new()).await.unwrap();
	}

	#[tokio::test]
	async fn handshake_failure_surfaces_as_not_supported() {
		let (client_side, _server_task) = spawn_server(StubBroker::new(RemoteServiceConnectionInfo::empty()));
		let (reader, writer) = tokio::io::split(client_side);
		let client = BrokerWireClient::connect(tokio::io::BufReader::new(reader), writer);

		let metadata = ServiceBrokerClientMetadata::new(SupportedConnections::NONE);
		let err = client.handshake(metadata, CancellationToken::new()).await.unwrap_err();
		assert!(matches!(err, BrokerError::NotSupported(_)));
	}

	#[tokio::test]
	async fn request_service_channel_round_trips_connection_info() {
		let info = RemoteServiceConnectionInfo {
			request_id: Some(ServiceRequestId::new_random()),
			pipe_name: Some("relay-channel".into()),
			..Default::default()
		};
		let (client_side, _server_task) = spawn_server(StubBroker::new(info.clone()));
		let (reader, writer) = tokio::io::split(client_side);
		let client = BrokerWireClient::connect(tokio::io::BufReader::new(reader), writer);

		let got = client
			.request_service_channel(ServiceMoniker::new("calc"), ServiceActivationOptions::default(), CancellationToken::new())
			.await
			.unwrap();
		assert_eq!(got, info);
	}
}
