//! Wiring between the library crates: a calculator [`ServiceBroker`],
//! republished over the IPC relay, served over a long-lived socket
//! speaking the broker-wire protocol; and a smoke-test client exercising
//! the same stack end to end.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use brokerage_core::{BrokerError, ProxyFactory, ProxyFactoryError, RemoteServiceBroker, ServiceBroker};
use brokerage_disposable::AsyncDisposable;
use brokerage_ipc::{ConnectOptions, DuplexPipe, ServerOptions};
use brokerage_moniker::ServiceMoniker;
use brokerage_relay::IpcRelayBroker;
use brokerage_remote_client::RemoteServiceBrokerClient;
use brokerage_rpc::demo::{JsonFrame, JsonRequest};
use brokerage_rpc::{CounterIdGen, MainLoop};

use crate::broker_wire::{BrokerWireClient, BrokerWireProtocol, BrokerWireServer};
use crate::calculator::CalculatorBroker;

/// Turns a connected pipe into a [`RemoteServiceBroker`] proxy speaking
/// [`BrokerWireProtocol`] — the seam `get_proxy`/`connect_to_duplex` were
/// designed around.
struct BrokerWireProxyFactory;

impl ProxyFactory<Arc<dyn RemoteServiceBroker>> for BrokerWireProxyFactory {
	fn create_proxy(&self, pipe: DuplexPipe) -> Result<Arc<dyn RemoteServiceBroker>, ProxyFactoryError> {
		let (reader, writer) = tokio::io::split(pipe);
		let client = BrokerWireClient::connect(BufReader::new(reader), writer);
		Ok(Arc::new(client))
	}
}

/// Runs the daemon: binds `socket_path`, serving the calculator broker
/// through the IPC relay over the broker-wire protocol, until `shutdown`
/// is cancelled.
pub async fn serve(socket_path: &Path, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
	let calculator = CalculatorBroker::new() as Arc<dyn ServiceBroker>;
	let relay = IpcRelayBroker::new(calculator);

	let address = socket_path.to_str().ok_or("socket path must be valid UTF-8")?.to_string();
	let (handle, bound_address) = brokerage_ipc::serve(
		&address,
		move |pipe| {
			let relay = relay.clone() as Arc<dyn RemoteServiceBroker>;
			async move {
				let (reader, writer) = tokio::io::split(pipe);
				let (main_loop, peer) =
					MainLoop::new(move |peer| BrokerWireServer::new(relay, peer), BrokerWireProtocol, CounterIdGen::new());
				drop(peer);
				if let Err(e) = main_loop.run(BufReader::new(reader), writer).await {
					tracing::warn!(error = %e, "broker-wire connection ended");
				}
			}
		},
		ServerOptions::default(),
	)
	.await?;

	tracing::info!(address = %bound_address, "brokerd listening");
	shutdown.cancelled().await;
	tracing::info!("shutting down brokerd");
	AsyncDisposable::dispose(&handle).await.map_err(|e| e.to_string())?;
	Ok(())
}

/// Connects to a running daemon, calls the calculator's `add`, and prints
/// the result — exercises connect/add/cancel against a live broker stack.
pub async fn smoke_test(socket_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
	let cancel = CancellationToken::new();
	let address = socket_path.to_str().ok_or("socket path must be valid UTF-8")?;

	let broker_pipe = brokerage_ipc::connect(address, &cancel, ConnectOptions::default()).await?;
	let remote = RemoteServiceBrokerClient::connect_to_duplex(broker_pipe, &BrokerWireProxyFactory, None, cancel.clone())
		.await
		.map_err(describe)?;

	let moniker = ServiceMoniker::new("calc");
	let service_pipe = remote
		.get_pipe(&moniker, Default::default(), cancel.clone())
		.await
		.map_err(describe)?
		.ok_or("calculator service unavailable")?;

	let (reader, mut writer) = tokio::io::split(service_pipe);
	let mut reader = BufReader::new(reader);

	let request = JsonFrame::Request(JsonRequest {
		id: 0,
		method: "add".to_string(),
		params: serde_json::json!([3, 5]),
	});
	let mut line = serde_json::to_string(&request)?;
	line.push('\n');
	writer.write_all(line.as_bytes()).await?;

	let mut reply = String::new();
	reader.read_line(&mut reply).await?;
	let frame: JsonFrame = serde_json::from_str(reply.trim_end())?;
	match frame {
		JsonFrame::Response(resp) if resp.error.is_none() => {
			tracing::info!(result = ?resp.result, "calculator replied");
			Ok(())
		}
		other => Err(format!("calculator reply was not a successful response: {other:?}").into()),
	}
}

fn describe(e: BrokerError) -> String {
	e.to_string()
}
