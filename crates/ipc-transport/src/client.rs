use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::path::resolve_address;
use crate::{DuplexPipe, IpcError};

#[cfg(unix)]
use crate::unix::{classify_connect_error, try_connect_once, ConnectErrorClass};
#[cfg(windows)]
use crate::windows::{classify_connect_error, try_connect_once, ConnectErrorClass};

/// Client-side connect behavior.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
	/// The caller knows the pipe already exists (e.g. it just read the
	/// address from a successful `request-service-channel` response), so a
	/// single wait-for-connection call is appropriate instead of polling.
	pub allow_spin_wait: bool,
	/// Delay between retry attempts when not spin-waiting.
	pub retry_delay: Duration,
	/// Cap on generic ("pipe busy"/timeout) retry attempts.
	pub max_retries: usize,
	/// Separate, smaller cap on "not found" failures — these most likely
	/// mean the server has not bound yet, so they are not worth retrying
	/// as many times as a generic timeout.
	pub max_not_found_retries: usize,
	/// Windows-only: verify the connected pipe's owner SID against the
	/// local identity.
	pub current_user_only: bool,
}

impl Default for ConnectOptions {
	fn default() -> Self {
		Self {
			allow_spin_wait: false,
			retry_delay: Duration::from_millis(20),
			max_retries: 50,
			max_not_found_retries: 3,
			current_user_only: false,
		}
	}
}

/// A declarative retry policy: bounds the total time spent, the number of
/// attempts, and the delay between them as a function of the attempt
/// index.
#[derive(Clone)]
pub struct RetryPolicy {
	pub max_duration: Duration,
	pub max_retries: usize,
	pub delay_fn: std::sync::Arc<dyn Fn(usize) -> Duration + Send + Sync>,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_duration: Duration::from_secs(30),
			max_retries: 50,
			delay_fn: std::sync::Arc::new(|retry| {
				std::cmp::min(Duration::from_millis(100) * retry as u32, Duration::from_secs(5))
			}),
		}
	}
}

impl fmt::Debug for RetryPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RetryPolicy")
			.field("max_duration", &self.max_duration)
			.field("max_retries", &self.max_retries)
			.finish_non_exhaustive()
	}
}

/// Counts of each exception kind observed across a connect-with-retry
/// sequence, surfaced in the final timeout error message.
#[derive(Debug, Clone, Default)]
pub struct RetryHistogram {
	counts: HashMap<&'static str, usize>,
}

impl RetryHistogram {
	fn record(&mut self, kind: &'static str) {
		*self.counts.entry(kind).or_insert(0) += 1;
	}
}

impl fmt::Display for RetryHistogram {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.counts.is_empty() {
			return write!(f, "(no failures recorded)");
		}
		let mut entries: Vec<_> = self.counts.iter().collect();
		entries.sort_by_key(|(k, _)| *k);
		for (i, (kind, count)) in entries.iter().enumerate() {
			if i > 0 {
				write!(f, ", ")?;
			}
			write!(f, "{kind}={count}")?;
		}
		Ok(())
	}
}

/// Connects to `name_or_path` with CPU-friendly retry.
///
/// If `options.allow_spin_wait` is set, this performs a single blocking
/// wait-for-connection attempt (appropriate when the caller already knows
/// the server exists). Otherwise it repeatedly attempts a non-waiting
/// connect, retrying on failure with a short fixed delay, capping
/// "not found" failures separately from other failures since they most
/// likely mean the server has not bound yet.
pub async fn connect(
	name_or_path: &str,
	cancel: &CancellationToken,
	options: ConnectOptions,
) -> Result<DuplexPipe, IpcError> {
	let address = resolve_address(name_or_path);

	if options.allow_spin_wait {
		return connect_attempt(&address, &options).await.map_err(IpcError::Io);
	}

	let mut histogram = RetryHistogram::default();
	let mut not_found_count = 0usize;
	let mut attempt = 0usize;

	loop {
		if cancel.is_cancelled() {
			return Err(IpcError::Cancelled);
		}

		match connect_attempt(&address, &options).await {
			Ok(pipe) => return Ok(pipe),
			Err(e) => {
				let class = classify_connect_error(&e);
				match class {
					ConnectErrorClass::NotFound => {
						histogram.record("not-found");
						not_found_count += 1;
						if not_found_count > options.max_not_found_retries {
							return Err(IpcError::Timeout {
								attempts: attempt + 1,
								histogram,
							});
						}
					}
					ConnectErrorClass::Other => {
						histogram.record("timeout");
					}
				}
			}
		}

		attempt += 1;
		if attempt >= options.max_retries {
			return Err(IpcError::Timeout {
				attempts: attempt,
				histogram,
			});
		}

		tokio::select! {
			biased;
			() = cancel.cancelled() => return Err(IpcError::Cancelled),
			() = tokio::time::sleep(options.retry_delay) => {}
		}
	}
}

#[cfg(unix)]
async fn connect_attempt(address: &str, _options: &ConnectOptions) -> std::io::Result<DuplexPipe> {
	try_connect_once(address).await
}

#[cfg(windows)]
async fn connect_attempt(address: &str, options: &ConnectOptions) -> std::io::Result<DuplexPipe> {
	try_connect_once(address, options.current_user_only).await
}

/// Wraps [`connect`] with a declarative [`RetryPolicy`]: bounds total
/// elapsed time in addition to attempt count, using the policy's delay
/// function between attempts.
pub async fn connect_with_policy(
	name_or_path: &str,
	cancel: &CancellationToken,
	mut options: ConnectOptions,
	policy: RetryPolicy,
) -> Result<DuplexPipe, IpcError> {
	let deadline = tokio::time::Instant::now() + policy.max_duration;
	options.max_retries = policy.max_retries;

	let address = resolve_address(name_or_path);
	let mut histogram = RetryHistogram::default();
	let mut attempt = 0usize;

	loop {
		if cancel.is_cancelled() {
			return Err(IpcError::Cancelled);
		}
		if tokio::time::Instant::now() >= deadline {
			return Err(IpcError::Timeout {
				attempts: attempt,
				histogram,
			});
		}

		match connect_attempt(&address, &options).await {
			Ok(pipe) => return Ok(pipe),
			Err(_) => histogram.record("timeout"),
		}

		attempt += 1;
		if attempt >= policy.max_retries {
			return Err(IpcError::Timeout {
				attempts: attempt,
				histogram,
			});
		}

		let delay = (policy.delay_fn)(attempt);
		tokio::select! {
			biased;
			() = cancel.cancelled() => return Err(IpcError::Cancelled),
			() = tokio::time::sleep(delay) => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_delay_fn_caps_at_five_seconds() {
		let policy = RetryPolicy::default();
		assert_eq!((policy.delay_fn)(1), Duration::from_millis(100));
		assert_eq!((policy.delay_fn)(1000), Duration::from_secs(5));
	}

	#[test]
	fn histogram_renders_sorted_counts() {
		let mut h = RetryHistogram::default();
		h.record("timeout");
		h.record("not-found");
		h.record("timeout");
		assert_eq!(h.to_string(), "not-found=1, timeout=2");
	}
}
