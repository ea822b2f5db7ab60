//! Hosts the demo calculator contract behind a [`ServiceBroker`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use brokerage_core::{AvailabilityChangedSource, BrokerError, ServiceBroker};
use brokerage_ipc::DuplexPipe;
use brokerage_moniker::{BrokeredServicesChangedEventArgs, ServiceActivationOptions, ServiceMoniker};
use brokerage_rpc::demo::{CalculatorService, JsonLineProtocol};
use brokerage_rpc::{CounterIdGen, MainLoop};

const CALCULATOR_MONIKER: &str = "calc";

/// The only moniker this broker answers. Each `get_pipe` call spins up a
/// fresh duplex pair and pumps one end through a [`MainLoop`] running
/// [`CalculatorService`], handing the other end back as the connected
/// pipe — the same shape an out-of-process service host would use, just
/// without the process boundary.
#[derive(Default)]
pub struct CalculatorBroker {
	availability: AvailabilityChangedSource,
}

impl CalculatorBroker {
	#[must_use]
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}
}

#[async_trait]
impl ServiceBroker for CalculatorBroker {
	async fn get_pipe(
		&self,
		moniker: &ServiceMoniker,
		_options: ServiceActivationOptions,
		_cancel: CancellationToken,
	) -> Result<Option<DuplexPipe>, BrokerError> {
		if moniker.name() != CALCULATOR_MONIKER {
			return Ok(None);
		}

		let (ours, theirs) = tokio::io::duplex(4096);
		let (reader, writer) = tokio::io::split(ours);
		let (main_loop, _peer) = MainLoop::new(|_peer| CalculatorService, JsonLineProtocol::new(), CounterIdGen::new());
		tokio::spawn(async move {
			if let Err(e) = main_loop.run(tokio::io::BufReader::new(reader), writer).await {
				tracing::debug!(error = %e, "calculator main loop ended");
			}
		});
		Ok(Some(Box::new(theirs)))
	}

	fn subscribe_availability_changed(&self) -> broadcast::Receiver<BrokeredServicesChangedEventArgs> {
		self.availability.subscribe()
	}
}
