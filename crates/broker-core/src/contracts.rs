use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use brokerage_ipc::DuplexPipe;
use brokerage_moniker::{
	BrokeredServicesChangedEventArgs, RemoteServiceConnectionInfo, ServiceActivationOptions,
	ServiceBrokerClientMetadata, ServiceMoniker, ServiceRequestId,
};

use crate::error::BrokerError;

/// Capacity of a broker's availability-changed broadcast channel. A slow or
/// absent subscriber only ever misses old events; it never blocks a
/// publisher raising one.
const AVAILABILITY_CHANGED_CAPACITY: usize = 64;

/// Process-local or aggregate service lookup: the pipe half of §4.3's
/// `IServiceBroker`. The typed `get-proxy<T>` half is [`get_proxy`], built
/// on top of this and a [`ProxyFactory`] — the out-of-scope RPC runtime
/// collaborator that actually knows how to turn a pipe into `T`.
#[async_trait]
pub trait ServiceBroker: Send + Sync {
	/// Requests a raw duplex pipe to the service named by `moniker`.
	/// Returns `Ok(None)` when no matching service exists. Fails with
	/// [`BrokerError::ServiceActivationFailed`] when the service exists but
	/// only an in-process activation is available — the pipe overload
	/// cannot represent that.
	async fn get_pipe(
		&self,
		moniker: &ServiceMoniker,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<Option<DuplexPipe>, BrokerError>;

	/// Subscribes to this broker's availability-changed notifications.
	/// Aggregators forward inner brokers' events with themselves as the
	/// observable source (§4.4), so subscribers never need to know which
	/// inner broker actually changed.
	fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs>;
}

/// Failure from [`ProxyFactory::create_proxy`] that hands the pipe back so
/// the caller can tear it down instead of leaking a half-claimed
/// connection.
pub struct ProxyFactoryError {
	pub pipe: DuplexPipe,
	pub error: BrokerError,
}

/// Produces a typed proxy `T` from a connected duplex pipe — the seam
/// where the out-of-scope RPC runtime collaborator plugs in (§1: "given a
/// duplex byte stream and a contract type, yields a client proxy").
pub trait ProxyFactory<T>: Send + Sync {
	fn create_proxy(&self, pipe: DuplexPipe) -> Result<T, ProxyFactoryError>;
}

/// `get-proxy<T>`: acquires a pipe via [`ServiceBroker::get_pipe`] and hands
/// it to `factory`. If proxy construction fails after the pipe was
/// acquired, the pipe is shut down before the error is surfaced, so no
/// connection is ever left dangling.
pub async fn get_proxy<T>(
	broker: &dyn ServiceBroker,
	moniker: &ServiceMoniker,
	options: ServiceActivationOptions,
	cancel: CancellationToken,
	factory: &dyn ProxyFactory<T>,
) -> Result<Option<T>, BrokerError> {
	let Some(pipe) = broker.get_pipe(moniker, options, cancel).await? else {
		return Ok(None);
	};
	match factory.create_proxy(pipe) {
		Ok(proxy) => Ok(Some(proxy)),
		Err(ProxyFactoryError { mut pipe, error }) => {
			let _ = pipe.shutdown().await;
			Err(error)
		}
	}
}

/// Wire-level contract a remote process serves: handshake, per-request
/// channel negotiation, and cancellation of a pending reservation (§4.3).
#[async_trait]
pub trait RemoteServiceBroker: Send + Sync {
	/// Called once per connection. Fails with [`BrokerError::NotSupported`]
	/// if this side cannot satisfy any of the client's supported
	/// connection kinds.
	async fn handshake(
		&self,
		client_metadata: ServiceBrokerClientMetadata,
		cancel: CancellationToken,
	) -> Result<(), BrokerError>;

	/// On success, resources may be reserved on this side; the caller must
	/// either connect to the returned instructions or cancel.
	async fn request_service_channel(
		&self,
		moniker: ServiceMoniker,
		options: ServiceActivationOptions,
		cancel: CancellationToken,
	) -> Result<RemoteServiceConnectionInfo, BrokerError>;

	/// Idempotent: cancelling an id that is unknown (already connected,
	/// already cancelled, or never issued) is not an error.
	async fn cancel_service_request(&self, id: ServiceRequestId);

	/// Subscribes to this side's availability-changed notifications, pushed
	/// over the wire as an unsolicited event rather than polled (§6).
	fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs>;
}

/// Helper for broker implementations: owns the broadcast-sender half of
/// [`ServiceBroker::subscribe_availability_changed`] and raises events to
/// it, silently if there are no subscribers.
#[derive(Clone)]
pub struct AvailabilityChangedSource {
	tx: broadcast::Sender<BrokeredServicesChangedEventArgs>,
}

impl Default for AvailabilityChangedSource {
	fn default() -> Self {
		let (tx, _rx) = broadcast::channel(AVAILABILITY_CHANGED_CAPACITY);
		Self { tx }
	}
}

impl AvailabilityChangedSource {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs> {
		self.tx.subscribe()
	}

	/// Raises the event. No-op if there are currently no subscribers.
	pub fn raise(&self, args: BrokeredServicesChangedEventArgs) {
		let _ = self.tx.send(args);
	}
}

/// Spawns a task that forwards `source`'s availability-changed events onto
/// `sink` until `source` is dropped — the mechanism every aggregator in
/// this crate uses to preserve the event "with the aggregator as sender"
/// (§4.4).
pub fn forward_availability_changed(
	source: broadcast::Receiver<BrokeredServicesChangedEventArgs>,
	sink: AvailabilityChangedSource,
) -> tokio::task::JoinHandle<()> {
	let mut source = source;
	tokio::spawn(async move {
		loop {
			match source.recv().await {
				Ok(args) => sink.raise(args),
				Err(broadcast::error::RecvError::Lagged(_)) => continue,
				Err(broadcast::error::RecvError::Closed) => break,
			}
		}
	})
}
