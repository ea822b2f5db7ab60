use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a service contract: a required name plus an optional,
/// free-form version.
///
/// Equality and hashing are derived from both fields using ordinal
/// (byte-exact, case-sensitive) comparison on `name` — two monikers with the
/// same name and different versions are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceMoniker {
	name: String,
	version: Option<String>,
}

impl ServiceMoniker {
	/// Creates a moniker with no version.
	///
	/// # Panics
	///
	/// Panics if `name` is empty; use [`ServiceMoniker::try_new`] to handle
	/// that case without panicking.
	#[must_use]
	pub fn new(name: impl Into<String>) -> Self {
		Self::try_new(name, None).expect("service moniker name must be non-empty")
	}

	/// Creates a moniker with an explicit version.
	///
	/// # Panics
	///
	/// Panics if `name` is empty.
	#[must_use]
	pub fn with_version(name: impl Into<String>, version: impl Into<String>) -> Self {
		Self::try_new(name, Some(version.into())).expect("service moniker name must be non-empty")
	}

	/// Fallible constructor: rejects an empty name instead of panicking.
	pub fn try_new(
		name: impl Into<String>,
		version: Option<String>,
	) -> Result<Self, EmptyMonikerName> {
		let name = name.into();
		if name.is_empty() {
			return Err(EmptyMonikerName);
		}
		Ok(Self { name, version })
	}

	/// The moniker's name.
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// The moniker's free-form version, if any.
	#[must_use]
	pub fn version(&self) -> Option<&str> {
		self.version.as_deref()
	}
}

impl fmt::Display for ServiceMoniker {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.version {
			Some(v) => write!(f, "{}/{}", self.name, v),
			None => write!(f, "{}", self.name),
		}
	}
}

/// Returned when attempting to build a [`ServiceMoniker`] with an empty name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("service moniker name must be non-empty")]
pub struct EmptyMonikerName;
