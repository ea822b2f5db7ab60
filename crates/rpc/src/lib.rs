//! Generic async message pump shared by every wire protocol the broker
//! speaks: the local IPC transport, a remote relay connection, and a
//! proxied LSP-style sub-connection each plug a [`Protocol`] and an
//! [`RpcService`] into the same [`MainLoop`].
//!
//! This crate does not know anything about service monikers, brokers, or
//! activation — it only pumps length-framed messages in one end and
//! dispatches requests to a [`tower_service::Service`] on the other.

pub mod demo;

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;

use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tower_service::Service;

/// The three shapes an inbound wire message can take, after a protocol has
/// decoded it off the stream.
#[derive(Debug)]
pub enum Inbound<Req, Resp, Notif> {
	Request(Req),
	Response(Resp),
	Notification(Notif),
}

/// A wire protocol: how to frame messages on the stream and how to route
/// them between the four message shapes a [`MainLoop`] understands.
///
/// Implementors decide encoding (JSON, postcard, length-prefixed or
/// line-delimited) and id allocation; the loop itself is protocol-agnostic.
pub trait Protocol: Send + 'static {
	type Id: Copy + Eq + std::hash::Hash + Send + Sync + 'static;
	type Message: Send + 'static;
	type Request: Send + 'static;
	type Response: Send + 'static;
	type Notification: Send + 'static;
	type ReqResult: Send + 'static;
	type ReqError: Send + 'static;
	type LoopError: std::error::Error + Send + From<std::io::Error> + 'static;
	type IdGen: Default + Send + 'static;

	fn next_id(id_gen: &mut Self::IdGen) -> Self::Id;

	fn read_message(
		&mut self,
		input: &mut (impl AsyncBufRead + Unpin + Send),
	) -> impl std::future::Future<Output = std::io::Result<Self::Message>> + Send;

	fn write_message(
		&mut self,
		output: &mut (impl AsyncWrite + Unpin + Send),
		msg: &Self::Message,
	) -> impl std::future::Future<Output = std::io::Result<()>> + Send;

	fn split_inbound(msg: Self::Message) -> Inbound<Self::Request, Self::Response, Self::Notification>;

	fn request_id(req: &Self::Request) -> Self::Id;
	fn set_request_id(req: &mut Self::Request, id: Self::Id);
	fn response_id(resp: &Self::Response) -> Self::Id;

	fn wrap_request(req: Self::Request) -> Self::Message;
	fn wrap_response(resp: Self::Response) -> Self::Message;
	fn wrap_notification(notif: Self::Notification) -> Self::Message;

	fn response_ok(id: Self::Id, result: Self::ReqResult) -> Self::Response;
	fn response_err(id: Self::Id, error: Self::ReqError) -> Self::Response;

	/// Extra messages to push out immediately after a response (e.g. the
	/// broker protocol emits a heartbeat event right after acknowledging a
	/// subscribe). Most protocols need nothing here.
	fn post_response_messages(_resp: &Self::Response) -> Vec<Self::Message> {
		Vec::new()
	}

	fn is_disconnect(err: &Self::LoopError) -> bool;
}

/// A type-erased out-of-band event delivered to [`RpcService::emit`].
///
/// Used for waking a service up about something that did not arrive over
/// the wire — a timer firing, a peer disconnecting elsewhere in the
/// process — without growing the protocol's notification type for every
/// internal concern.
pub struct AnyEvent(Box<dyn std::any::Any + Send>);

impl AnyEvent {
	pub fn new<T: Send + 'static>(value: T) -> Self {
		Self(Box::new(value))
	}

	pub fn downcast<T: 'static>(self) -> Result<T, AnyEvent> {
		match self.0.downcast::<T>() {
			Ok(boxed) => Ok(*boxed),
			Err(boxed) => Err(AnyEvent(boxed)),
		}
	}
}

impl fmt::Debug for AnyEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("AnyEvent(..)")
	}
}

/// A monotonic, process-local id generator. The default [`Protocol::IdGen`]
/// for protocols that don't need anything fancier than a counter.
#[derive(Debug, Default)]
pub struct CounterIdGen(u64);

impl CounterIdGen {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn next(&mut self) -> u64 {
		let id = self.0;
		self.0 += 1;
		id
	}
}

/// An event pushed into a running [`MainLoop`] from outside the read loop:
/// an outgoing notification, an outgoing request awaiting a reply, or an
/// out-of-band event for [`RpcService::emit`].
pub enum MainLoopEvent<M, Req, Resp> {
	Outgoing(M),
	OutgoingRequest(Req, oneshot::Sender<Resp>),
	Emit(AnyEvent),
}

impl<M, Req, Resp> fmt::Debug for MainLoopEvent<M, Req, Resp> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Outgoing(_) => f.write_str("MainLoopEvent::Outgoing(..)"),
			Self::OutgoingRequest(_, _) => f.write_str("MainLoopEvent::OutgoingRequest(..)"),
			Self::Emit(_) => f.write_str("MainLoopEvent::Emit(..)"),
		}
	}
}

/// The error returned once the peer side of a [`MainLoop`] has gone away.
#[derive(Debug, thiserror::Error)]
#[error("peer socket closed")]
pub struct PeerSocketClosed;

/// A cloneable handle for pushing outgoing traffic into a running
/// [`MainLoop`] from any task — the loop itself owns the only reader/writer
/// half of the stream, so this is how a service's side tasks talk back to
/// the connection that spawned them.
pub struct PeerSocket<M, Req, Resp>(mpsc::UnboundedSender<MainLoopEvent<M, Req, Resp>>);

impl<M, Req, Resp> Clone for PeerSocket<M, Req, Resp> {
	fn clone(&self) -> Self {
		Self(self.0.clone())
	}
}

impl<M, Req, Resp> fmt::Debug for PeerSocket<M, Req, Resp> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("PeerSocket(..)")
	}
}

impl<M, Req, Resp> PeerSocket<M, Req, Resp> {
	/// Pushes a raw event onto the loop's event queue.
	pub fn send(&self, event: MainLoopEvent<M, Req, Resp>) -> Result<(), PeerSocketClosed> {
		self.0.send(event).map_err(|_| PeerSocketClosed)
	}

	/// Sends a one-way message and returns immediately.
	pub fn notify(&self, msg: M) -> Result<(), PeerSocketClosed> {
		self.send(MainLoopEvent::Outgoing(msg))
	}

	/// Sends a request and awaits its matched response.
	pub async fn request(&self, req: Req) -> Result<Resp, PeerSocketClosed> {
		let (tx, rx) = oneshot::channel();
		self.send(MainLoopEvent::OutgoingRequest(req, tx))?;
		rx.await.map_err(|_| PeerSocketClosed)
	}

	/// Delivers an out-of-band event to the service's [`RpcService::emit`].
	pub fn emit(&self, event: AnyEvent) -> Result<(), PeerSocketClosed> {
		self.send(MainLoopEvent::Emit(event))
	}
}

/// A [`tower_service::Service`] that also reacts to inbound notifications
/// and out-of-band events, and can signal the loop to stop.
pub trait RpcService<P: Protocol>:
	Service<P::Request, Response = P::ReqResult, Error = P::ReqError>
{
	type LoopError: std::error::Error + Send + 'static;

	/// Handles an inbound notification. Returning `ControlFlow::Break` stops
	/// the main loop, surfacing the wrapped result as its outcome.
	fn notify(&mut self, notif: P::Notification) -> ControlFlow<Result<(), Self::LoopError>> {
		let _ = notif;
		ControlFlow::Continue(())
	}

	/// Handles an out-of-band event sent via [`PeerSocket::emit`].
	fn emit(&mut self, event: AnyEvent) -> ControlFlow<Result<(), Self::LoopError>> {
		let _ = event;
		ControlFlow::Continue(())
	}
}

/// Pumps a single connection: reads framed messages off `R`, dispatches
/// requests to the service, matches responses against outstanding
/// `PeerSocket::request` calls, and serializes outgoing traffic onto `W`.
///
/// Exactly one `MainLoop` runs per connection; it owns the only reader and
/// writer half, so all outgoing traffic — including from other tasks —
/// flows through the [`PeerSocket`] handed back by [`MainLoop::new`].
pub struct MainLoop<P: Protocol, S> {
	protocol: P,
	id_gen: P::IdGen,
	service: S,
	events_rx: mpsc::UnboundedReceiver<MainLoopEvent<P::Message, P::Request, P::Response>>,
	pending: HashMap<P::Id, oneshot::Sender<P::Response>>,
}

impl<P, S> MainLoop<P, S>
where
	P: Protocol,
	S: RpcService<P, LoopError = P::LoopError>,
{
	/// Creates a new main loop and the [`PeerSocket`] handle that feeds it.
	/// `factory` builds the service from that same handle, so the service
	/// can hand out clones of its own outgoing channel.
	pub fn new<F>(
		factory: F,
		protocol: P,
		id_gen: P::IdGen,
	) -> (Self, PeerSocket<P::Message, P::Request, P::Response>)
	where
		F: FnOnce(PeerSocket<P::Message, P::Request, P::Response>) -> S,
	{
		let (tx, events_rx) = mpsc::unbounded_channel();
		let socket = PeerSocket(tx);
		let service = factory(socket.clone());
		(
			Self {
				protocol,
				id_gen,
				service,
				events_rx,
				pending: HashMap::new(),
			},
			socket,
		)
	}

	/// Runs the loop to completion: until the peer disconnects, the service
	/// asks to stop, or the loop's own event channel is dropped.
	pub async fn run<R, W>(mut self, mut reader: R, mut writer: W) -> Result<(), P::LoopError>
	where
		R: AsyncBufRead + Unpin + Send,
		W: AsyncWrite + Unpin + Send,
	{
		loop {
			tokio::select! {
				biased;
				incoming = self.protocol.read_message(&mut reader) => {
					let msg = match incoming {
						Ok(msg) => msg,
						Err(e) => {
							let err = P::LoopError::from(e);
							if P::is_disconnect(&err) {
								return Ok(());
							}
							return Err(err);
						}
					};
					match P::split_inbound(msg) {
						Inbound::Request(req) => self.handle_request(req, &mut writer).await?,
						Inbound::Response(resp) => self.handle_response(resp),
						Inbound::Notification(notif) => {
							if let ControlFlow::Break(result) = self.service.notify(notif) {
								return result;
							}
						}
					}
				}
				event = self.events_rx.recv() => {
					match event {
						Some(MainLoopEvent::Outgoing(msg)) => {
							self.protocol.write_message(&mut writer, &msg).await.map_err(P::LoopError::from)?;
						}
						Some(MainLoopEvent::OutgoingRequest(mut req, reply)) => {
							let id = P::next_id(&mut self.id_gen);
							P::set_request_id(&mut req, id);
							self.pending.insert(id, reply);
							let msg = P::wrap_request(req);
							self.protocol.write_message(&mut writer, &msg).await.map_err(P::LoopError::from)?;
						}
						Some(MainLoopEvent::Emit(event)) => {
							if let ControlFlow::Break(result) = self.service.emit(event) {
								return result;
							}
						}
						None => return Ok(()),
					}
				}
			}
		}
	}

	async fn handle_request<W>(&mut self, req: P::Request, writer: &mut W) -> Result<(), P::LoopError>
	where
		W: AsyncWrite + Unpin + Send,
	{
		let id = P::request_id(&req);
		let resp = match std::future::poll_fn(|cx| self.service.poll_ready(cx)).await {
			Ok(()) => match self.service.call(req).await {
				Ok(result) => P::response_ok(id, result),
				Err(error) => P::response_err(id, error),
			},
			Err(error) => P::response_err(id, error),
		};

		let extra = P::post_response_messages(&resp);
		let msg = P::wrap_response(resp);
		self.protocol.write_message(writer, &msg).await.map_err(P::LoopError::from)?;
		for msg in extra {
			self.protocol.write_message(writer, &msg).await.map_err(P::LoopError::from)?;
		}
		Ok(())
	}

	fn handle_response(&mut self, resp: P::Response) {
		let id = P::response_id(&resp);
		if let Some(reply) = self.pending.remove(&id) {
			let _ = reply.send(resp);
		}
	}
}
