use serde::{Deserialize, Serialize};

/// A (moniker, optional trust-level) pair identifying one protected
/// operation an authorization service can be asked about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtectedOperation {
	pub moniker: String,
	pub trust_level: Option<i32>,
}

impl ProtectedOperation {
	#[must_use]
	pub fn new(moniker: impl Into<String>, trust_level: Option<i32>) -> Self {
		Self {
			moniker: moniker.into(),
			trust_level,
		}
	}

	/// `self ⊇ other`: monikers match and `self`'s trust level is absent,
	/// equal to, or greater than `other`'s.
	///
	/// An absent trust level is treated as "no restriction", so it is a
	/// superset of every trust level including another absent one.
	#[must_use]
	pub fn is_superset_of(&self, other: &Self) -> bool {
		if self.moniker != other.moniker {
			return false;
		}
		match (self.trust_level, other.trust_level) {
			(None, _) => true,
			(Some(_), None) => false,
			(Some(a), Some(b)) => a >= b,
		}
	}

	/// `self ⊆ other`, i.e. `other.is_superset_of(self)`.
	#[must_use]
	pub fn is_subset_of(&self, other: &Self) -> bool {
		other.is_superset_of(self)
	}
}
