//! Socket-path resolution for the broker daemon.

use std::path::PathBuf;

/// Resolves the default IPC socket path.
///
/// # Resolution order
///
/// 1. `BROKERAGE_SOCKET` environment variable.
/// 2. System runtime directory (e.g. `$XDG_RUNTIME_DIR`), if writable.
/// 3. System temp directory.
///
/// The default file name is `brokerage.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
	if let Ok(p) = std::env::var("BROKERAGE_SOCKET") {
		return PathBuf::from(p);
	}

	dirs::runtime_dir()
		.filter(|p| std::fs::create_dir_all(p).is_ok())
		.unwrap_or_else(std::env::temp_dir)
		.join("brokerage.sock")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn env_override_wins_over_runtime_dir() {
		std::env::set_var("BROKERAGE_SOCKET", "/tmp/brokerd-explicit-test.sock");
		let resolved = default_socket_path();
		std::env::remove_var("BROKERAGE_SOCKET");
		assert_eq!(resolved, PathBuf::from("/tmp/brokerd-explicit-test.sock"));
	}
}
