use std::collections::HashMap;

use async_trait::async_trait;
use brokerage_moniker::ProtectedOperation;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::AuthError;

/// The out-of-scope remote authorization service collaborator:
/// `AuthorizationServiceClient` is a local cache in front of one of these.
#[async_trait]
pub trait AuthorizationService: Send + Sync {
	/// Asks the remote service whether `op` is currently approved.
	async fn check_authorization(&self, op: &ProtectedOperation, cancel: CancellationToken) -> Result<bool, AuthError>;

	/// Fetches the current client credential set.
	async fn get_credentials(&self, cancel: CancellationToken) -> Result<HashMap<String, String>, AuthError>;

	/// Raised when a previously cached verdict may no longer hold.
	fn subscribe_authorization_changed(&self) -> broadcast::Receiver<()>;

	/// Raised when the client's credential set has been replaced.
	fn subscribe_credentials_changed(&self) -> broadcast::Receiver<()>;
}
