use std::collections::HashMap;

use brokerage_moniker::ServiceActivationOptions;

/// How a proffered view's credentials interact with caller-supplied ones
/// (§4.10, supplemented per §11 into an explicit enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCredentialsPolicy {
	/// Keep caller-supplied credentials when non-empty; otherwise fill in
	/// the active view's credentials.
	RequestOverridesDefault,
	/// Always overwrite caller-supplied credentials with the active view's.
	FilterOverridesRequest,
}

impl ClientCredentialsPolicy {
	/// Applies this policy, given the options the caller originally
	/// supplied and the credentials the active view associates with the
	/// resolved registration.
	#[must_use]
	pub fn apply(&self, options: &ServiceActivationOptions, view_credentials: HashMap<String, String>) -> ServiceActivationOptions {
		match self {
			Self::RequestOverridesDefault => options.with_default_credentials(&view_credentials),
			Self::FilterOverridesRequest => options.with_overridden_credentials(view_credentials),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn options_with(credentials: &[(&str, &str)]) -> ServiceActivationOptions {
		let mut options = ServiceActivationOptions::default();
		for (k, v) in credentials {
			options.client_credentials.insert((*k).to_string(), (*v).to_string());
		}
		options
	}

	#[test]
	fn request_overrides_default_keeps_caller_value() {
		let options = options_with(&[("token", "caller")]);
		let view = HashMap::from([("token".to_string(), "view".to_string())]);
		let merged = ClientCredentialsPolicy::RequestOverridesDefault.apply(&options, view);
		assert_eq!(merged.client_credentials["token"], "caller");
	}

	#[test]
	fn request_overrides_default_fills_missing_keys() {
		let options = ServiceActivationOptions::default();
		let view = HashMap::from([("token".to_string(), "view".to_string())]);
		let merged = ClientCredentialsPolicy::RequestOverridesDefault.apply(&options, view);
		assert_eq!(merged.client_credentials["token"], "view");
	}

	#[test]
	fn filter_overrides_request_always_wins() {
		let options = options_with(&[("token", "caller")]);
		let view = HashMap::from([("token".to_string(), "view".to_string())]);
		let merged = ClientCredentialsPolicy::FilterOverridesRequest.apply(&options, view);
		assert_eq!(merged.client_credentials["token"], "view");
	}
}
