use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::moniker::ServiceMoniker;

/// Payload of an availability-changed notification.
///
/// When `other_services_impacted` is set, the consumer must treat *all*
/// cached services as potentially stale, not just the ones named in
/// `impacted_services`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokeredServicesChangedEventArgs {
	pub impacted_services: HashSet<ServiceMoniker>,
	pub other_services_impacted: bool,
}

impl BrokeredServicesChangedEventArgs {
	#[must_use]
	pub fn for_monikers(monikers: impl IntoIterator<Item = ServiceMoniker>) -> Self {
		Self {
			impacted_services: monikers.into_iter().collect(),
			other_services_impacted: false,
		}
	}

	#[must_use]
	pub fn all_impacted() -> Self {
		Self {
			impacted_services: HashSet::new(),
			other_services_impacted: true,
		}
	}

	/// Whether `moniker` should be treated as possibly stale by this event.
	#[must_use]
	pub fn impacts(&self, moniker: &ServiceMoniker) -> bool {
		self.other_services_impacted || self.impacted_services.contains(moniker)
	}
}
