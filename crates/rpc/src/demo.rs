//! A minimal newline-delimited JSON [`Protocol`], used by this crate's own
//! tests and by `brokerd`'s demo calculator service. Nothing here is part
//! of the broker wire format proper — the real IPC transport is free to
//! plug in postcard, length-prefixed framing, or anything else.

use std::io::ErrorKind;
use std::ops::ControlFlow;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tower_service::Service;

use crate::{AnyEvent, CounterIdGen, Inbound, Protocol, RpcService};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRequest {
	pub id: u64,
	pub method: String,
	pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonResponse {
	pub id: u64,
	pub result: Option<serde_json::Value>,
	pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonNotification {
	pub method: String,
	pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame")]
pub enum JsonFrame {
	Request(JsonRequest),
	Response(JsonResponse),
	Notification(JsonNotification),
}

/// One JSON value per line, UTF-8, newline-terminated.
#[derive(Debug, Clone, Default)]
pub struct JsonLineProtocol;

impl JsonLineProtocol {
	pub const fn new() -> Self {
		Self
	}
}

impl Protocol for JsonLineProtocol {
	type Id = u64;
	type Message = JsonFrame;
	type Request = JsonRequest;
	type Response = JsonResponse;
	type Notification = JsonNotification;
	type ReqResult = serde_json::Value;
	type ReqError = String;
	type LoopError = std::io::Error;
	type IdGen = CounterIdGen;

	fn next_id(id_gen: &mut Self::IdGen) -> Self::Id {
		id_gen.next()
	}

	async fn read_message(
		&mut self,
		input: &mut (impl AsyncBufRead + Unpin + Send),
	) -> std::io::Result<Self::Message> {
		let mut line = String::new();
		let bytes = input.read_line(&mut line).await?;
		if bytes == 0 {
			return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "peer closed the stream"));
		}
		serde_json::from_str(line.trim_end()).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
	}

	async fn write_message(
		&mut self,
		output: &mut (impl AsyncWrite + Unpin + Send),
		msg: &Self::Message,
	) -> std::io::Result<()> {
		let mut line = serde_json::to_string(msg).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
		line.push('\n');
		output.write_all(line.as_bytes()).await?;
		output.flush().await
	}

	fn split_inbound(msg: Self::Message) -> Inbound<Self::Request, Self::Response, Self::Notification> {
		match msg {
			JsonFrame::Request(req) => Inbound::Request(req),
			JsonFrame::Response(resp) => Inbound::Response(resp),
			JsonFrame::Notification(notif) => Inbound::Notification(notif),
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
		JsonFrame::Request(req)
	}

	fn wrap_response(resp: Self::Response) -> Self::Message {
		JsonFrame::Response(resp)
	}

	fn wrap_notification(notif: Self::Notification) -> Self::Message {
		JsonFrame::Notification(notif)
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

/// Answers `add` requests over [`JsonLineProtocol`], ignores everything
/// else. Minimal enough to exercise a main loop's request/response path
/// end to end; reused by this crate's own tests and by `brokerd`'s demo
/// calculator.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalculatorService;

impl Service<JsonRequest> for CalculatorService {
	type Response = serde_json::Value;
	type Error = String;
	type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, req: JsonRequest) -> Self::Future {
		Box::pin(async move {
			if req.method != "add" {
				return Err(format!("unknown method: {}", req.method));
			}
			let params: (i64, i64) = serde_json::from_value(req.params).map_err(|e| e.to_string())?;
			Ok(serde_json::json!(params.0 + params.1))
		})
	}
}

impl RpcService<JsonLineProtocol> for CalculatorService {
	type LoopError = std::io::Error;

	fn emit(&mut self, _event: AnyEvent) -> ControlFlow<Result<(), Self::LoopError>> {
		ControlFlow::Continue(())
	}
}
