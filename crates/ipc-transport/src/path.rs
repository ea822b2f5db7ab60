use std::path::{Path, PathBuf};

/// Resolves a bare channel name or a full path/pipe-name into the address
/// form the current platform expects.
///
/// On Windows that means `\\.\pipe\<name>`; on POSIX it means
/// `<runtime-or-temp-dir>/<name>`. A value that already looks like a full
/// path/pipe-name is passed through unchanged.
#[must_use]
pub fn resolve_address(name_or_path: &str) -> String {
	if is_full_address(name_or_path) {
		return name_or_path.to_string();
	}
	prefixed(name_or_path)
}

#[cfg(windows)]
#[must_use]
fn is_full_address(s: &str) -> bool {
	s.starts_with(r"\\")
}

#[cfg(unix)]
#[must_use]
fn is_full_address(s: &str) -> bool {
	Path::new(s).is_absolute()
}

#[cfg(windows)]
#[must_use]
fn prefixed(name: &str) -> String {
	format!(r"\\.\pipe\{name}")
}

#[cfg(unix)]
#[must_use]
fn prefixed(name: &str) -> String {
	runtime_dir().join(name).to_string_lossy().into_owned()
}

#[cfg(unix)]
fn runtime_dir() -> PathBuf {
	dirs::runtime_dir()
		.filter(|p| std::fs::create_dir_all(p).is_ok())
		.unwrap_or_else(std::env::temp_dir)
}

/// Generates a fresh, collision-resistant channel name for one-shot relay
/// servers (the relay stands up a new channel per request).
#[must_use]
pub fn fresh_channel_name(prefix: &str) -> String {
	format!("{prefix}-{}", uuid_like_suffix())
}

fn uuid_like_suffix() -> String {
	use std::time::{SystemTime, UNIX_EPOCH};

	// A request-scoped, not globally unique identifier is sufficient here;
	// callers that need true global uniqueness use `ServiceRequestId`
	// alongside the channel name.
	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_nanos())
		.unwrap_or_default();
	format!("{nanos:x}-{:x}", std::process::id())
}
