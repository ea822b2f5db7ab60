bitflags::bitflags! {
	/// Who a registration's services may be proffered to.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct Audience: u8 {
		const SAME_PROCESS = 0x01;
		const SAME_USER = 0x02;
		const ALL_USERS = 0x04;
	}
}

/// Classification of the party asking the container for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumer {
	pub audience: Audience,
	/// Whether this consumer is a guest (unauthenticated or otherwise
	/// unprivileged) session. Registrations must opt in to guest access.
	pub is_guest: bool,
	/// Whether the consumer lives in the same process as the container.
	/// Determines whether remote sources are searched at all (§4.10: "if
	/// the consumer is local, searches remote sources first").
	pub is_local: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn audience_masks_combine() {
		let mask = Audience::SAME_PROCESS | Audience::SAME_USER;
		assert!(mask.contains(Audience::SAME_USER));
		assert!(!mask.contains(Audience::ALL_USERS));
	}
}
