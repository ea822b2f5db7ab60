use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::moniker::ServiceMoniker;

/// Message formatter a descriptor's RPC runtime should use on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Formatter {
	/// Human-readable UTF-8 JSON.
	Utf8Json,
	/// A compact binary form (e.g. MessagePack).
	MessagePack,
}

/// Message-framing strategy a descriptor's RPC runtime should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Framing {
	/// HTTP-like `Content-Length:` header framing.
	HttpLikeHeaders,
	/// A big-endian 32-bit length prefix.
	BigEndianInt32LengthHeader,
}

/// Sub-channel setup options for descriptors that ride a multiplexing
/// stream instead of (or in addition to) a plain duplex pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MultiplexingOptions {
	/// Name of the sub-channel to open or accept, if not the default.
	pub channel_name: Option<String>,
}

/// Error returned when constructing a descriptor with an invalid
/// formatter/framing combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
	/// `MessagePack` formatting with HTTP-like header framing is not a
	/// supported combination.
	#[error("MessagePack formatting with HTTP-like header framing is not supported")]
	IncompatibleFormatterFraming,
}

/// An immutable value identifying one logical service contract: a moniker
/// plus enough shape information for an RPC runtime to produce a proxy.
///
/// Descriptors are *reshapeable*: each `with_*` method returns a clone
/// differing in exactly one field. Equality and hashing only consider
/// `moniker`, `formatter` and `framing` — the fields that determine whether
/// two descriptors describe interchangeable wire shapes for the same
/// service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRpcDescriptor {
	moniker: ServiceMoniker,
	protocol: Cow<'static, str>,
	formatter: Formatter,
	framing: Framing,
	/// Type name of the client callback contract for duplex RPC, if the
	/// service may call back into the consumer. Carried as a name only —
	/// this crate does not depend on the contract type itself.
	client_callback_contract: Option<Cow<'static, str>>,
	multiplexing_options: Option<MultiplexingOptions>,
}

impl ServiceRpcDescriptor {
	/// Builds a descriptor, rejecting the one documented invalid
	/// formatter/framing combination.
	pub fn new(
		moniker: ServiceMoniker,
		protocol: impl Into<Cow<'static, str>>,
		formatter: Formatter,
		framing: Framing,
	) -> Result<Self, DescriptorError> {
		if formatter == Formatter::MessagePack && framing == Framing::HttpLikeHeaders {
			return Err(DescriptorError::IncompatibleFormatterFraming);
		}
		Ok(Self {
			moniker,
			protocol: protocol.into(),
			formatter,
			framing,
			client_callback_contract: None,
			multiplexing_options: None,
		})
	}

	/// Convenience constructor for the common `json-rpc` / UTF-8 JSON /
	/// length-prefixed shape.
	#[must_use]
	pub fn json_rpc(moniker: ServiceMoniker) -> Self {
		Self::new(
			moniker,
			"json-rpc",
			Formatter::Utf8Json,
			Framing::BigEndianInt32LengthHeader,
		)
		.expect("utf8json + length-prefix is always a valid combination")
	}

	#[must_use]
	pub fn moniker(&self) -> &ServiceMoniker {
		&self.moniker
	}

	#[must_use]
	pub fn protocol(&self) -> &str {
		&self.protocol
	}

	#[must_use]
	pub fn formatter(&self) -> Formatter {
		self.formatter
	}

	#[must_use]
	pub fn framing(&self) -> Framing {
		self.framing
	}

	#[must_use]
	pub fn client_callback_contract(&self) -> Option<&str> {
		self.client_callback_contract.as_deref()
	}

	#[must_use]
	pub fn multiplexing_options(&self) -> Option<&MultiplexingOptions> {
		self.multiplexing_options.as_ref()
	}

	/// Returns a clone with a different moniker.
	#[must_use]
	pub fn with_moniker(&self, moniker: ServiceMoniker) -> Self {
		Self {
			moniker,
			..self.clone()
		}
	}

	/// Returns a clone with a different client callback contract name.
	#[must_use]
	pub fn with_client_callback_contract(&self, contract: impl Into<Cow<'static, str>>) -> Self {
		Self {
			client_callback_contract: Some(contract.into()),
			..self.clone()
		}
	}

	/// Returns a clone configured to ride a multiplexing sub-channel.
	#[must_use]
	pub fn with_multiplexing_options(&self, options: MultiplexingOptions) -> Self {
		Self {
			multiplexing_options: Some(options),
			..self.clone()
		}
	}
}

impl PartialEq for ServiceRpcDescriptor {
	fn eq(&self, other: &Self) -> bool {
		self.moniker == other.moniker
			&& self.formatter == other.formatter
			&& self.framing == other.framing
	}
}

impl Eq for ServiceRpcDescriptor {}

impl std::hash::Hash for ServiceRpcDescriptor {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.moniker.hash(state);
		// Formatter/Framing are small enums; fold them into the moniker hash
		// via their discriminant so descriptor hashing stays cheap.
		(self.formatter as u8 as u32 + (self.framing as u8 as u32) * 16).hash(state);
	}
}
