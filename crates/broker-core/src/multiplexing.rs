use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use brokerage_disposable::AsyncDisposable;
use brokerage_ipc::DuplexPipe;
use brokerage_moniker::MultiplexingStreamHandle;

use crate::error::BrokerError;

/// The out-of-scope multiplexing-stream collaborator (§1, §9): a single
/// duplex connection that can open and accept further named or numbered
/// sub-channels, each itself usable as a duplex pipe. This crate only needs
/// enough of that protocol to hand a relay a fresh pipe per request; the
/// framing that actually interleaves sub-channels over one socket is not
/// this crate's concern. Disposing the stream tears down every sub-channel
/// along with the underlying duplex.
#[async_trait]
pub trait MultiplexingStream: AsyncDisposable {
	/// Offers a new sub-channel. `id = None` lets the multiplexer assign
	/// one; passing `Some(0)` offers the reserved default channel used for
	/// the broker proxy itself when a multiplexing server is stood up.
	/// Resolves once the channel is usable, which may be before the peer
	/// has actually accepted it — see [`wait_for_acceptance`].
	///
	/// [`wait_for_acceptance`]: MultiplexingStream::wait_for_acceptance
	async fn offer_channel(&self, id: Option<u64>) -> Result<(u64, DuplexPipe), BrokerError>;

	/// Accepts a sub-channel the peer previously offered under this id.
	/// `id = 0` accepts the reserved default channel.
	async fn accept_channel(&self, id: u64) -> Result<DuplexPipe, BrokerError>;

	/// Resolves once the peer has accepted the sub-channel `id` that this
	/// side offered. Used to release resources (e.g. a pending-request
	/// entry) held only until the client actually connects.
	async fn wait_for_acceptance(&self, id: u64) -> Result<(), BrokerError>;

	/// Closes a single offered sub-channel without tearing down the rest of
	/// the stream — used to unwind a cancelled reservation.
	async fn close_channel(&self, id: u64) -> Result<(), BrokerError>;
}

/// Opaque carrier so a concrete [`MultiplexingStream`] can travel inside a
/// [`MultiplexingStreamHandle`] (`Arc<dyn Any + Send + Sync>` on
/// `ServiceActivationOptions`) without that crate knowing this trait exists.
struct MultiplexingStreamSlot(Arc<dyn MultiplexingStream>);

/// Wraps a concrete multiplexing stream into the opaque handle type carried
/// on activation options.
#[must_use]
pub fn wrap_multiplexing_stream(stream: Arc<dyn MultiplexingStream>) -> MultiplexingStreamHandle {
	Arc::new(MultiplexingStreamSlot(stream)) as MultiplexingStreamHandle
}

/// Recovers the concrete multiplexing stream from an activation option's
/// opaque handle, if it was built by [`wrap_multiplexing_stream`].
#[must_use]
pub fn unwrap_multiplexing_stream(handle: &MultiplexingStreamHandle) -> Option<Arc<dyn MultiplexingStream>> {
	(handle.clone() as Arc<dyn Any + Send + Sync>)
		.downcast::<MultiplexingStreamSlot>()
		.ok()
		.map(|slot| slot.0.clone())
}
