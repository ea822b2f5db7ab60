use std::io;
use std::os::windows::io::AsRawHandle;
use std::time::Duration;

use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, PipeMode, ServerOptions};

use crate::DuplexPipe;

/// Windows named-pipe server instance. Each accepted client consumes this
/// pipe instance; a fresh one must be created before the next `accept`
/// (unless the server is one-client-only, in which case the accept loop
/// simply stops).
pub(crate) struct PlatformServer {
	address: String,
	current_user_only: bool,
	current: NamedPipeServer,
}

impl PlatformServer {
	pub(crate) fn bind(address: &str, current_user_only: bool) -> io::Result<Self> {
		let current = new_instance(address, current_user_only, true)?;
		Ok(Self {
			address: address.to_string(),
			current_user_only,
			current,
		})
	}

	pub(crate) async fn accept(&mut self) -> io::Result<DuplexPipe> {
		self.current.connect().await?;
		// `self.current` is swapped out here; the caller must invoke
		// `recreate` before the next `accept` (the shared accept loop in
		// `server.rs` does this, skipping it only in one-client-only mode).
		let placeholder = new_instance(&self.address, self.current_user_only, false)?;
		let connected = std::mem::replace(&mut self.current, placeholder);
		Ok(Box::new(connected))
	}

	pub(crate) fn recreate(&mut self) -> io::Result<()> {
		self.current = new_instance(&self.address, self.current_user_only, false)?;
		Ok(())
	}
}

fn new_instance(
	address: &str,
	current_user_only: bool,
	first: bool,
) -> io::Result<NamedPipeServer> {
	let mut opts = ServerOptions::new();
	opts.pipe_mode(PipeMode::Byte)
		.access_inbound(true)
		.access_outbound(true);
	if first {
		opts.first_pipe_instance(true);
	}
	if current_user_only {
		opts.reject_remote_clients(true);
	}
	opts.create(address)
}

/// Non-blocking connect attempt, used by the client-side retry loop.
///
/// Mirrors the documented policy: a short `WaitNamedPipe` probe followed by
/// `CreateFile`, rather than the (possibly unbounded) natural
/// wait-for-connection timeout.
pub(crate) async fn try_connect_once(
	address: &str,
	current_user_only: bool,
) -> io::Result<DuplexPipe> {
	wait_named_pipe_probe(address, Duration::from_millis(1)).await?;
	let client = ClientOptions::new().open(address)?;
	if current_user_only {
		verify_current_user_only_handle(client.as_raw_handle())?;
	}
	Ok(Box::new(client))
}

async fn wait_named_pipe_probe(address: &str, timeout: Duration) -> io::Result<()> {
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		match ClientOptions::new().open(address) {
			Ok(_) => return Ok(()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(e),
			Err(_) if tokio::time::Instant::now() < deadline => {
				tokio::time::sleep(Duration::from_micros(200)).await;
			}
			Err(e) => return Err(e),
		}
	}
}

pub(crate) fn classify_connect_error(err: &io::Error) -> ConnectErrorClass {
	match err.kind() {
		io::ErrorKind::NotFound => ConnectErrorClass::NotFound,
		_ => ConnectErrorClass::Other,
	}
}

pub(crate) enum ConnectErrorClass {
	NotFound,
	Other,
}

/// Compares the connected pipe's owning security identifier against the
/// current process token and rejects the connection on mismatch.
fn verify_current_user_only_handle(
	handle: std::os::windows::io::RawHandle,
) -> io::Result<()> {
	use windows_sys::Win32::Foundation::HANDLE;
	use windows_sys::Win32::Security::Authorization::{GetSecurityInfo, SE_KERNEL_OBJECT};
	use windows_sys::Win32::Security::{OWNER_SECURITY_INFORMATION, PSID};

	unsafe {
		let mut owner: PSID = std::ptr::null_mut();
		let mut sd = std::ptr::null_mut();
		let status = GetSecurityInfo(
			handle as HANDLE,
			SE_KERNEL_OBJECT,
			OWNER_SECURITY_INFORMATION,
			&mut owner,
			std::ptr::null_mut(),
			std::ptr::null_mut(),
			std::ptr::null_mut(),
			&mut sd,
		);
		if status != 0 {
			return Err(io::Error::from_raw_os_error(status as i32));
		}
		let matches = current_process_owns_sid(owner);
		if !sd.is_null() {
			windows_sys::Win32::Foundation::LocalFree(sd as isize);
		}
		if matches {
			Ok(())
		} else {
			Err(io::Error::new(
				io::ErrorKind::PermissionDenied,
				"remote pipe owner does not match the local user",
			))
		}
	}
}

/// Whether `candidate` equals the SID of the current process's own token
/// user.
unsafe fn current_process_owns_sid(candidate: windows_sys::Win32::Security::PSID) -> bool {
	use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
	use windows_sys::Win32::Security::{EqualSid, GetTokenInformation, TokenUser, TOKEN_QUERY, TOKEN_USER};
	use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

	if candidate.is_null() {
		return false;
	}

	let mut token: HANDLE = std::ptr::null_mut();
	if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
		return false;
	}

	let mut buf = [0u8; 512];
	let mut needed = 0u32;
	let ok = GetTokenInformation(
		token,
		TokenUser,
		buf.as_mut_ptr().cast(),
		buf.len() as u32,
		&mut needed,
	);
	CloseHandle(token);
	if ok == 0 {
		return false;
	}

	let token_user = &*buf.as_ptr().cast::<TOKEN_USER>();
	EqualSid(candidate, token_user.User.Sid) != 0
}
