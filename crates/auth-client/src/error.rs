/// Errors raised by the authorization client and its underlying service.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	/// The remote authorization check or credential fetch itself failed.
	#[error("authorization service call failed: {0}")]
	ServiceFailure(String),
	/// Cooperative cancellation. Always rethrown unwrapped.
	#[error("operation cancelled")]
	Cancelled,
}
