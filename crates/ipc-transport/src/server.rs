use std::future::Future;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use brokerage_disposable::{AsyncDisposable, DisposeError};
use tokio_util::sync::CancellationToken;

use crate::path::resolve_address;
use crate::DuplexPipe;

#[cfg(unix)]
use crate::unix::PlatformServer;
#[cfg(windows)]
use crate::windows::PlatformServer;

/// Options controlling how a server accepts connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
	/// After one client is accepted, stop listening instead of recreating
	/// the server instance for a next one.
	pub one_client_only: bool,
	/// Windows-only: restrict the pipe to clients running as the same
	/// user. Ignored on POSIX, where socket-directory permissions already
	/// provide the equivalent guarantee.
	pub current_user_only: bool,
}

/// A disposable handle to a running accept loop. Disposing it cancels the
/// loop and releases the underlying listener/pipe.
pub struct ServerHandle {
	cancel: CancellationToken,
	task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl AsyncDisposable for ServerHandle {
	async fn dispose(&self) -> Result<(), DisposeError> {
		self.cancel.cancel();
		if let Some(task) = self.task.lock().await.take() {
			let _ = task.await;
		}
		Ok(())
	}
}

/// Starts an accept loop on `name_or_path` (resolved to the platform's
/// native address form), invoking `on_connect` once per accepted client.
///
/// `on_connect` is always invoked sequentially — the loop awaits its
/// completion before accepting the next client — and is dispatched to a
/// spawned worker rather than run inline on the accept task.
///
/// Returns the running server's disposable handle and its resolved
/// address.
pub async fn serve<F, Fut>(
	name_or_path: &str,
	on_connect: F,
	options: ServerOptions,
) -> io::Result<(ServerHandle, String)>
where
	F: Fn(DuplexPipe) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	let address = resolve_address(name_or_path);
	let platform = bind(&address, &options)?;
	let cancel = CancellationToken::new();

	let loop_address = address.clone();
	let loop_cancel = cancel.clone();
	let on_connect = Arc::new(on_connect);
	let task = tokio::spawn(accept_loop(
		platform,
		loop_address,
		options,
		on_connect,
		loop_cancel,
	));

	Ok((
		ServerHandle {
			cancel,
			task: tokio::sync::Mutex::new(Some(task)),
		},
		address,
	))
}

#[cfg(unix)]
fn bind(address: &str, _options: &ServerOptions) -> io::Result<PlatformServer> {
	PlatformServer::bind(address)
}

#[cfg(windows)]
fn bind(address: &str, options: &ServerOptions) -> io::Result<PlatformServer> {
	PlatformServer::bind(address, options.current_user_only)
}

async fn accept_loop<F, Fut>(
	mut platform: PlatformServer,
	address: String,
	options: ServerOptions,
	on_connect: Arc<F>,
	cancel: CancellationToken,
) where
	F: Fn(DuplexPipe) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	loop {
		let accepted = tokio::select! {
			biased;
			() = cancel.cancelled() => break,
			accepted = platform.accept() => accepted,
		};

		match accepted {
			Ok(pipe) => {
				// Yield to a worker before invoking the handler so the
				// accept task is never blocked by handler work; await its
				// completion so invocations stay strictly sequential.
				let handler = on_connect.clone();
				let handled = tokio::spawn(async move { handler(pipe).await });
				let _ = handled.await;

				if options.one_client_only {
					break;
				}
				if let Err(e) = platform.recreate() {
					tracing::error!(error = %e, address = %address, "failed to recreate IPC server instance");
					break;
				}
			}
			Err(e) if cancel.is_cancelled() => {
				tracing::debug!(address = %address, "IPC accept loop cancelled: {e}");
				break;
			}
			Err(e) => {
				tracing::warn!(error = %e, address = %address, "IPC accept failure, rebinding server instance");
				match bind(&address, &options) {
					Ok(fresh) => platform = fresh,
					Err(e) => {
						tracing::error!(error = %e, address = %address, "failed to rebind IPC server after accept failure");
						break;
					}
				}
			}
		}
	}
}

#[cfg(all(test, unix))]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::UnixStream;

	use super::*;

	#[tokio::test]
	async fn accepts_and_invokes_handler_once() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("one-client.sock");
		let count = Arc::new(AtomicUsize::new(0));
		let count_clone = count.clone();

		let (handle, address) = serve(
			path.to_str().unwrap(),
			move |mut pipe: DuplexPipe| {
				let count = count_clone.clone();
				async move {
					count.fetch_add(1, Ordering::SeqCst);
					let mut buf = [0u8; 5];
					let _ = pipe.read_exact(&mut buf).await;
					let _ = pipe.write_all(b"pong").await;
				}
			},
			ServerOptions {
				one_client_only: true,
				..Default::default()
			},
		)
		.await
		.unwrap();

		let mut client = UnixStream::connect(&address).await.unwrap();
		client.write_all(b"hello").await.unwrap();
		let mut reply = [0u8; 4];
		client.read_exact(&mut reply).await.unwrap();
		assert_eq!(&reply, b"pong");

		AsyncDisposable::dispose(&handle).await.unwrap();
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}
}
