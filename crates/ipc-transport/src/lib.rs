//! Platform-abstracted one-to-one bidirectional byte stream transport: a
//! named pipe on Windows, a Unix-domain socket on POSIX.
//!
//! Callers only see [`DuplexPipe`], [`serve`] and [`connect`] — the
//! platform split lives in the private `unix`/`windows` modules.

mod client;
mod path;
mod server;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use client::{connect, ConnectOptions, RetryHistogram, RetryPolicy};
pub use path::{fresh_channel_name, resolve_address};
pub use server::{serve, ServerHandle, ServerOptions};

/// A connected bidirectional byte stream, erased across platforms.
pub trait DuplexIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexIo for T {}

/// A connected duplex pipe: either end of a named pipe or Unix-domain
/// socket connection, or an accepted multiplexing sub-channel wrapped to
/// the same shape by a higher layer.
pub type DuplexPipe = Box<dyn DuplexIo>;

/// Errors raised by the IPC transport layer.
#[derive(Debug, Error)]
pub enum IpcError {
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error("connect-with-retry exhausted after {attempts} attempt(s): {histogram}")]
	Timeout {
		attempts: usize,
		histogram: RetryHistogram,
	},
	#[error("operation cancelled")]
	Cancelled,
	#[error("remote pipe owner does not match the local user")]
	UnauthorizedPipeOwner,
}
